//! Recursive, cycle-safe assembly of a scene document and its imports.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde_yaml::Value;

use crate::platform::{Platform, RequestError, RequestHandle, UrlResponse};
use crate::resource::{ResourceUrl, SceneArchive};
use crate::scene::{SceneError, SceneErrorKind};
use crate::util::worker::AsyncWorker;

/// The parsed scene document tree.
pub type Document = Value;

const MATERIAL_TEXTURE_PROPS: [&str; 5] =
    ["emission", "ambient", "diffuse", "specular", "normal"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathStep {
    Key(String),
    Index(usize),
}

/// A position inside a document where a scalar may need to be rewritten into a texture URL,
/// together with the scalar originally found there.
#[derive(Debug, Clone)]
struct TextureSite {
    path: Vec<PathStep>,
    original: String,
}

/// One node of the import graph.
#[derive(Debug, Default)]
struct SceneNode {
    doc: Document,
    imports: Vec<ResourceUrl>,
    texture_sites: Vec<TextureSite>,
}

#[derive(Default)]
struct ImporterState {
    queue: VecDeque<ResourceUrl>,
    nodes: HashMap<ResourceUrl, SceneNode, ahash::RandomState>,
    archives: HashMap<ResourceUrl, Arc<SceneArchive>, ahash::RandomState>,
    requests: Vec<RequestHandle>,
    active_downloads: u32,
    errors: Vec<SceneError>,
    zip_worker: Option<AsyncWorker>,
}

/// Fetches a root document and everything it transitively imports, then merges the documents
/// into a single tree.
///
/// [`Importer::load`] blocks its calling thread on a condition variable while fetches are
/// outstanding; it is meant to run on the scene worker, never on the main thread. A concurrent
/// [`Importer::cancel`] makes the load return an empty tree.
pub struct Importer {
    state: Mutex<ImporterState>,
    progress: Condvar,
    canceled: AtomicBool,
}

impl Importer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ImporterState::default()),
            progress: Condvar::new(),
            canceled: AtomicBool::new(false),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Marks the importer canceled and cancels its outstanding URL requests. The in-flight
    /// callbacks still settle the download counter, so a blocked [`Importer::load`] wakes up.
    pub fn cancel(&self, platform: &dyn Platform) {
        self.canceled.store(true, Ordering::Release);

        let requests: Vec<RequestHandle> = {
            let mut state = self.state.lock();
            state.requests.drain(..).collect()
        };
        for handle in requests {
            platform.cancel_url_request(handle);
        }

        self.progress.notify_all();
    }

    /// Errors collected so far, draining the internal list.
    pub fn take_errors(&self) -> Vec<SceneError> {
        std::mem::take(&mut self.state.lock().errors)
    }

    /// Loads and merges the scene rooted at `root_url`. When `inline_yaml` is given it is used
    /// as the root document instead of fetching `root_url`.
    pub fn load(
        self: &Arc<Self>,
        platform: &Arc<dyn Platform>,
        root_url: &ResourceUrl,
        inline_yaml: Option<&str>,
    ) -> Document {
        if let Some(yaml) = inline_yaml {
            let mut state = self.state.lock();
            state
                .nodes
                .insert(root_url.clone(), SceneNode::default());
            self.add_scene_yaml(&mut state, root_url.clone(), yaml.as_bytes());
        } else {
            self.state.lock().queue.push_back(root_url.clone());
        }

        loop {
            let mut state = self.state.lock();

            if state.queue.is_empty() || self.is_canceled() {
                if state.active_downloads == 0 {
                    break;
                }
                self.progress.wait(&mut state);
                continue;
            }

            let Some(next) = state.queue.pop_front() else {
                continue;
            };
            // Reserve the URL so it cannot be scheduled twice.
            if state.nodes.contains_key(&next) {
                continue;
            }
            state.nodes.insert(next.clone(), SceneNode::default());
            state.active_downloads += 1;

            if next.scheme() == "zip" {
                let this = self.clone();
                let url = next.clone();
                let worker = state
                    .zip_worker
                    .get_or_insert_with(|| AsyncWorker::new("meridian-zip"));
                worker.enqueue(move || {
                    let response = this.read_zip_entry(&url);
                    this.on_fetch_complete(url, response);
                });
            } else {
                drop(state);

                let this = self.clone();
                let url = next.clone();
                let handle = platform.start_url_request(
                    &next,
                    Box::new(move |response| this.on_fetch_complete(url, response)),
                );
                self.state.lock().requests.push(handle);
            }
        }

        if self.is_canceled() {
            return Value::Null;
        }

        let nodes = std::mem::take(&mut self.state.lock().nodes);

        let mut root = Value::Null;
        let mut visited = HashSet::new();
        Self::merge_recursive(&nodes, &mut root, root_url, &mut visited);

        // After merging all scenes, resolve texture scalars as named textures or URLs.
        Self::resolve_texture_sites(&mut root, &nodes);

        root
    }

    fn on_fetch_complete(&self, url: ResourceUrl, response: UrlResponse) {
        {
            let mut state = self.state.lock();

            if !self.is_canceled() {
                match response {
                    Ok(bytes) => self.add_scene_data(&mut state, url, bytes),
                    Err(RequestError::Canceled) | Err(RequestError::ShutDown) => {}
                    Err(err) => {
                        log::error!("Unable to retrieve '{url}': {err}");
                        state.errors.push(SceneError {
                            url: Some(url.to_string()),
                            kind: SceneErrorKind::Fetch,
                            message: err.to_string(),
                        });
                    }
                }
            }

            state.active_downloads = state.active_downloads.saturating_sub(1);
        }

        self.progress.notify_one();
    }

    fn add_scene_data(&self, state: &mut ImporterState, url: ResourceUrl, bytes: Bytes) {
        log::debug!("Process: '{url}'");

        if !url.is_zip_archive() {
            self.add_scene_yaml(state, url, &bytes);
            return;
        }

        let archive = match SceneArchive::from_bytes(bytes) {
            Ok(archive) => archive,
            Err(err) => {
                state.errors.push(SceneError {
                    url: Some(url.to_string()),
                    kind: SceneErrorKind::Archive,
                    message: err.to_string(),
                });
                return;
            }
        };

        match archive.base_document() {
            Some(entry) => match archive.decompress_entry(entry) {
                Ok(content) => self.add_scene_yaml(state, url.clone(), &content),
                Err(err) => state.errors.push(SceneError {
                    url: Some(url.to_string()),
                    kind: SceneErrorKind::Archive,
                    message: err.to_string(),
                }),
            },
            None => state.errors.push(SceneError {
                url: Some(url.to_string()),
                kind: SceneErrorKind::Archive,
                message: "no base scene document in archive".to_owned(),
            }),
        }

        // Keep the archive for later `zip://` entry fetches.
        state.archives.insert(url, Arc::new(archive));
    }

    fn add_scene_yaml(&self, state: &mut ImporterState, url: ResourceUrl, bytes: &[u8]) {
        let doc: Document = match serde_yaml::from_slice(bytes) {
            Ok(doc) => doc,
            Err(err) => {
                log::error!("Parsing scene config '{url}': {err}");
                state.errors.push(SceneError {
                    url: Some(url.to_string()),
                    kind: SceneErrorKind::DocumentParse,
                    message: err.to_string(),
                });
                return;
            }
        };

        if !doc.is_mapping() {
            log::error!("Scene is not a valid document map: {url}");
            state.errors.push(SceneError {
                url: Some(url.to_string()),
                kind: SceneErrorKind::DocumentParse,
                message: "scene is not a map".to_owned(),
            });
            return;
        }

        let imports = Self::resolved_import_urls(&doc, &url);
        let texture_sites = collect_texture_sites(&doc);

        // Remove the import field so it does not get merged.
        let mut doc = doc;
        if let Some(mapping) = doc.as_mapping_mut() {
            mapping.remove(&Value::String("import".to_owned()));
        }

        for import in &imports {
            if !state.nodes.contains_key(import) && !state.queue.contains(import) {
                state.queue.push_back(import.clone());
            }
        }

        state.nodes.insert(
            url,
            SceneNode {
                doc,
                imports,
                texture_sites,
            },
        );
    }

    /// Only the root-level `import` key is consumed; nested `import` keys are not followed.
    fn resolved_import_urls(doc: &Document, url: &ResourceUrl) -> Vec<ResourceUrl> {
        let base = import_base(url);
        let mut imports = Vec::new();

        let mut push = |reference: &str| match base.resolve(reference) {
            Ok(resolved) => imports.push(resolved),
            Err(err) => log::warn!("Invalid import url '{reference}': {err}"),
        };

        match doc.get("import") {
            Some(Value::String(reference)) => push(reference),
            Some(Value::Sequence(references)) => {
                for reference in references {
                    if let Some(reference) = reference.as_str() {
                        push(reference);
                    }
                }
            }
            _ => {}
        }

        imports
    }

    fn read_zip_entry(&self, url: &ResourceUrl) -> UrlResponse {
        let archive_url = url
            .archive_url()
            .map_err(|err| RequestError::Network(err.to_string()))?;

        let archive = self
            .state
            .lock()
            .archives
            .get(&archive_url)
            .cloned()
            .ok_or_else(|| RequestError::Network("could not find zip archive".to_owned()))?;

        let entry = archive
            .find_entry(url.entry_path())
            .ok_or(RequestError::NotFound)?;

        let content = archive
            .decompress_entry(entry)
            .map_err(|err| RequestError::Network(err.to_string()))?;

        Ok(Bytes::from(content))
    }

    fn merge_recursive(
        nodes: &HashMap<ResourceUrl, SceneNode, ahash::RandomState>,
        root: &mut Document,
        url: &ResourceUrl,
        visited: &mut HashSet<ResourceUrl>,
    ) {
        // Insert self first to handle self-import cycles.
        visited.insert(url.clone());

        let Some(node) = nodes.get(url) else {
            return;
        };

        // An import already in the visited set was (or will be) merged by an ancestor, so it is
        // either redundant or a cycle. Skipping it keeps every document merged exactly once.
        let imports: Vec<ResourceUrl> = node
            .imports
            .iter()
            .filter(|import| !visited.contains(*import))
            .cloned()
            .collect();
        for import in &imports {
            visited.insert(import.clone());
        }

        for import in &imports {
            Self::merge_recursive(nodes, root, import, visited);
        }

        // A document that failed to fetch or parse is skipped; the error was already recorded.
        if !node.doc.is_null() {
            Self::merge_map_fields(root, &node.doc);
            Self::resolve_scene_urls(root, &import_base(url));
        }
    }

    /// Deep map-merge: maps merge per key, any other shape is overwritten by the importing
    /// document.
    fn merge_map_fields(target: &mut Document, import: &Document) {
        if target.is_mapping() && import.is_mapping() {
            let target_map = target.as_mapping_mut().expect("checked mapping");
            let import_map = import.as_mapping().expect("checked mapping");

            for (key, value) in import_map {
                let dest = target_map.entry(key.clone()).or_insert(Value::Null);
                Self::merge_map_fields(dest, value);
            }
        } else {
            if !target.is_null()
                && std::mem::discriminant(target) != std::mem::discriminant(import)
            {
                log::warn!("Merging different node types: {target:?} <- {import:?}");
            }

            *target = import.clone();
        }
    }

    /// Resolves the URL-carrying fields of the merged tree against the base of the document that
    /// was just merged. Already-absolute URLs resolve to themselves, so earlier resolutions
    /// survive later merges.
    fn resolve_scene_urls(root: &mut Document, base: &ResourceUrl) {
        if let Some(textures) = root.get_mut("textures").and_then(Value::as_mapping_mut) {
            for (_, texture) in textures.iter_mut() {
                if let Some(url) = texture.get_mut("url") {
                    resolve_url_scalar(url, base);
                }
            }
        }

        if let Some(sources) = root.get_mut("sources").and_then(Value::as_mapping_mut) {
            for (_, source) in sources.iter_mut() {
                if !source.is_mapping() {
                    continue;
                }
                if let Some(url) = source.get_mut("url") {
                    resolve_url_scalar(url, base);
                }
            }
        }

        if let Some(fonts) = root.get_mut("fonts").and_then(Value::as_mapping_mut) {
            for (_, font) in fonts.iter_mut() {
                if font.is_mapping() {
                    if let Some(url) = font.get_mut("url") {
                        resolve_url_scalar(url, base);
                    }
                } else if let Some(faces) = font.as_sequence_mut() {
                    for face in faces {
                        if let Some(url) = face.get_mut("url") {
                            resolve_url_scalar(url, base);
                        }
                    }
                }
            }
        }
    }

    /// Rewrites the recorded texture candidates: a scalar that names an entry of the merged
    /// `textures` map stays a named reference, anything else becomes a URL resolved against the
    /// document where the scalar appeared.
    fn resolve_texture_sites(
        root: &mut Document,
        nodes: &HashMap<ResourceUrl, SceneNode, ahash::RandomState>,
    ) {
        let texture_names: HashSet<String> = root
            .get("textures")
            .and_then(Value::as_mapping)
            .map(|textures| {
                textures
                    .keys()
                    .filter_map(|key| key.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();

        for (url, node) in nodes {
            let base = import_base(url);
            for site in &node.texture_sites {
                if texture_names.contains(&site.original) {
                    continue;
                }

                let Some(value) = value_at_path_mut(root, &site.path) else {
                    continue;
                };
                // Another document won the merge at this position; its own site record (if any)
                // covers the rewrite.
                if value.as_str() != Some(site.original.as_str()) {
                    continue;
                }

                if let Ok(resolved) = base.resolve(&site.original) {
                    *value = Value::String(resolved.to_string());
                }
            }
        }
    }
}

impl Default for Importer {
    fn default() -> Self {
        Self::new()
    }
}

/// Base URL against which references inside the document resolve. Zip archives use the
/// archive-entry scheme so that relative references stay inside the archive.
fn import_base(url: &ResourceUrl) -> ResourceUrl {
    if url.is_zip_archive() {
        match url.zip_base() {
            Ok(base) => base,
            Err(err) => {
                log::error!("Failed to build zip base url for '{url}': {err}");
                url.clone()
            }
        }
    } else {
        url.clone()
    }
}

fn resolve_url_scalar(value: &mut Value, base: &ResourceUrl) {
    let Some(scalar) = value.as_str() else {
        return;
    };
    if scalar.starts_with("global.") {
        return;
    }

    // Source URLs commonly carry {z}/{x}/{y} placeholders; they must survive resolution.
    if let Ok(resolved) = base.resolve_template(scalar) {
        *value = Value::String(resolved);
    }
}

/// A scalar is a texture candidate if it is a non-null string that is not a `global.` reference
/// and does not read as a number or boolean.
fn texture_candidate(value: &Value) -> Option<String> {
    let scalar = value.as_str()?;
    if scalar.starts_with("global.") {
        return None;
    }
    if scalar.parse::<f64>().is_ok() {
        return None;
    }
    if matches!(scalar, "true" | "false" | "yes" | "no") {
        return None;
    }

    Some(scalar.to_owned())
}

fn collect_texture_sites(doc: &Document) -> Vec<TextureSite> {
    let mut sites = Vec::new();

    let Some(styles) = doc.get("styles").and_then(Value::as_mapping) else {
        return sites;
    };

    for (style_name, style) in styles {
        let Some(style_name) = style_name.as_str() else {
            continue;
        };
        if !style.is_mapping() {
            continue;
        }

        let style_path = || {
            vec![
                PathStep::Key("styles".to_owned()),
                PathStep::Key(style_name.to_owned()),
            ]
        };

        if let Some(original) = style.get("texture").and_then(texture_candidate) {
            let mut path = style_path();
            path.push(PathStep::Key("texture".to_owned()));
            sites.push(TextureSite { path, original });
        }

        if let Some(material) = style.get("material").filter(|m| m.is_mapping()) {
            for prop in MATERIAL_TEXTURE_PROPS {
                let Some(prop_node) = material.get(prop).filter(|p| p.is_mapping()) else {
                    continue;
                };
                if let Some(original) = prop_node.get("texture").and_then(texture_candidate) {
                    let mut path = style_path();
                    path.push(PathStep::Key("material".to_owned()));
                    path.push(PathStep::Key(prop.to_owned()));
                    path.push(PathStep::Key("texture".to_owned()));
                    sites.push(TextureSite { path, original });
                }
            }
        }

        let uniforms = style
            .get("shaders")
            .filter(|s| s.is_mapping())
            .and_then(|shaders| shaders.get("uniforms"))
            .and_then(Value::as_mapping);
        if let Some(uniforms) = uniforms {
            for (uniform_name, uniform) in uniforms {
                let Some(uniform_name) = uniform_name.as_str() else {
                    continue;
                };

                let uniform_path = || {
                    let mut path = style_path();
                    path.push(PathStep::Key("shaders".to_owned()));
                    path.push(PathStep::Key("uniforms".to_owned()));
                    path.push(PathStep::Key(uniform_name.to_owned()));
                    path
                };

                if let Some(original) = texture_candidate(uniform) {
                    sites.push(TextureSite {
                        path: uniform_path(),
                        original,
                    });
                } else if let Some(elements) = uniform.as_sequence() {
                    for (index, element) in elements.iter().enumerate() {
                        if let Some(original) = texture_candidate(element) {
                            let mut path = uniform_path();
                            path.push(PathStep::Index(index));
                            sites.push(TextureSite { path, original });
                        }
                    }
                }
            }
        }
    }

    sites
}

fn value_at_path_mut<'a>(root: &'a mut Document, path: &[PathStep]) -> Option<&'a mut Value> {
    let mut current = root;
    for step in path {
        current = match step {
            PathStep::Key(key) => current.get_mut(key.as_str())?,
            PathStep::Index(index) => current.get_mut(*index)?,
        };
    }

    Some(current)
}
