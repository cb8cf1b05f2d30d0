//! Style definitions built from the merged scene document.

use serde_yaml::Value;

use crate::scene::{SceneError, SceneErrorKind};

/// Base kind of a style. Dispatching on the tag replaces the inheritance hierarchy a renderer
/// would otherwise need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleKind {
    Polygon,
    Polyline,
    Point,
    Text,
    Raster,
    Debug,
}

impl StyleKind {
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "polygons" => Some(Self::Polygon),
            "lines" => Some(Self::Polyline),
            "points" => Some(Self::Point),
            "text" => Some(Self::Text),
            "raster" => Some(Self::Raster),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }

    /// Rendering capabilities shared by every style of this kind.
    pub fn capabilities(&self) -> StyleCapabilities {
        match self {
            Self::Polygon | Self::Raster => StyleCapabilities {
                draw_mode: DrawMode::Triangles,
                vertex_layout: VertexLayout::Surface,
            },
            Self::Polyline => StyleCapabilities {
                draw_mode: DrawMode::Triangles,
                vertex_layout: VertexLayout::Extruded,
            },
            Self::Point | Self::Text => StyleCapabilities {
                draw_mode: DrawMode::Triangles,
                vertex_layout: VertexLayout::ScreenQuad,
            },
            Self::Debug => StyleCapabilities {
                draw_mode: DrawMode::Lines,
                vertex_layout: VertexLayout::Surface,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawMode {
    Triangles,
    Lines,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexLayout {
    /// Positions on the map surface.
    Surface,
    /// Positions extruded perpendicular to a line.
    Extruded,
    /// Screen-aligned quads anchored to a map position.
    ScreenQuad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StyleCapabilities {
    pub draw_mode: DrawMode,
    pub vertex_layout: VertexLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    Translucent,
    Add,
    Multiply,
    Inlay,
    Overlay,
}

impl BlendMode {
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "opaque" => Some(Self::Opaque),
            "translucent" => Some(Self::Translucent),
            "add" => Some(Self::Add),
            "multiply" => Some(Self::Multiply),
            "inlay" => Some(Self::Inlay),
            "overlay" => Some(Self::Overlay),
            _ => None,
        }
    }
}

/// One resolved style definition. The drawing rules themselves stay opaque to the pipeline and
/// are interpreted by the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct Style {
    pub name: String,
    pub kind: StyleKind,
    pub blend: BlendMode,
    pub blend_order: i32,
    pub texture: Option<String>,
}

impl Style {
    fn base(name: &str, kind: StyleKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            blend: BlendMode::default(),
            blend_order: 0,
            texture: None,
        }
    }

    pub fn capabilities(&self) -> StyleCapabilities {
        self.kind.capabilities()
    }
}

/// Builds the style list from the merged `styles` block. The built-in styles are always
/// present; user styles refine them through the `base` key.
pub fn build_styles(config: &Value) -> (Vec<Style>, Vec<SceneError>) {
    let mut styles = vec![
        Style::base("polygons", StyleKind::Polygon),
        Style::base("lines", StyleKind::Polyline),
        Style::base("points", StyleKind::Point),
        Style::base("text", StyleKind::Text),
        Style::base("raster", StyleKind::Raster),
        Style::base("debug", StyleKind::Debug),
    ];
    let mut errors = Vec::new();

    let Some(user_styles) = config.get("styles").and_then(|v| v.as_mapping()) else {
        return (styles, errors);
    };

    for (name, style_config) in user_styles {
        let Some(name) = name.as_str() else {
            continue;
        };

        if !style_config.is_mapping() {
            errors.push(SceneError {
                url: None,
                kind: SceneErrorKind::SceneBuild,
                message: format!("style '{name}' is not a map"),
            });
            continue;
        }

        let base = style_config.get("base").and_then(|v| v.as_str());
        let kind = match base {
            Some(base) => match StyleKind::parse(base) {
                Some(kind) => kind,
                None => {
                    errors.push(SceneError {
                        url: None,
                        kind: SceneErrorKind::SceneBuild,
                        message: format!("style '{name}' has unknown base '{base}'"),
                    });
                    continue;
                }
            },
            // A style without a base must itself name a built-in kind.
            None => match StyleKind::parse(name) {
                Some(kind) => kind,
                None => {
                    errors.push(SceneError {
                        url: None,
                        kind: SceneErrorKind::SceneBuild,
                        message: format!("style '{name}' has no base"),
                    });
                    continue;
                }
            },
        };

        let blend = match style_config.get("blend").and_then(|v| v.as_str()) {
            Some(blend) => match BlendMode::parse(blend) {
                Some(blend) => blend,
                None => {
                    errors.push(SceneError {
                        url: None,
                        kind: SceneErrorKind::SceneBuild,
                        message: format!("style '{name}' has unknown blend '{blend}'"),
                    });
                    continue;
                }
            },
            None => BlendMode::default(),
        };

        let blend_order = style_config
            .get("blend_order")
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as i32;
        let texture = style_config
            .get("texture")
            .and_then(|v| v.as_str())
            .map(str::to_owned);

        let style = Style {
            name: name.to_owned(),
            kind,
            blend,
            blend_order,
            texture,
        };

        match styles.iter_mut().find(|existing| existing.name == name) {
            Some(existing) => *existing = style,
            None => styles.push(style),
        }
    }

    (styles, errors)
}
