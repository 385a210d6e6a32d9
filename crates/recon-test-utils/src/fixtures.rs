//! Test fixtures for agent output directories.
//!
//! A [`ManifestFixture`] describes one manifest pair: the command ids of the
//! request manifest, the templates of the data manifest and which data files
//! actually exist. Writing it lays the files out the way an agent would.

use chrono::{DateTime, Duration, Utc};

use recon_core::manifest::{DATA_MANIFEST_PREFIX, REQUEST_MANIFEST_PREFIX};
use recon_core::model::ManifestFileSet;
use recon_core::paths::{file_tag, join};

use crate::storage::TracingObjectStore;

/// Default storage location tag used by fixtures.
pub const FIXTURE_COSMOS_TAG: &str = "vc1";

/// Default agent output root used by fixtures.
pub const FIXTURE_ROOT: &str = "vc1/AgentOutput";

/// Builder for one agent's manifest pair and data files.
#[derive(Debug, Clone)]
pub struct ManifestFixture {
    cosmos_tag: String,
    root: String,
    agent_id: String,
    suffix: String,
    commands: Vec<String>,
    templates: Vec<String>,
    files: Vec<(String, usize)>,
    created: DateTime<Utc>,
}

impl ManifestFixture {
    /// Creates a fixture for `agent_id` with manifests named `..._{suffix}`.
    ///
    /// Manifests are created an hour ago by default.
    pub fn new(agent_id: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            cosmos_tag: FIXTURE_COSMOS_TAG.to_string(),
            root: FIXTURE_ROOT.to_string(),
            agent_id: agent_id.into(),
            suffix: suffix.into(),
            commands: Vec::new(),
            templates: Vec::new(),
            files: Vec::new(),
            created: Utc::now() - Duration::hours(1),
        }
    }

    /// Adds a command id to the request manifest.
    #[must_use]
    pub fn with_command(mut self, id: impl Into<String>) -> Self {
        self.commands.push(id.into());
        self
    }

    /// Adds a data file of `size` bytes, listed in the data manifest.
    #[must_use]
    pub fn with_data_file(mut self, name: impl Into<String>, size: usize) -> Self {
        let name = name.into();
        self.templates.push(name.clone());
        self.files.push((name, size));
        self
    }

    /// Lists a data file in the data manifest without creating it.
    #[must_use]
    pub fn with_missing_data_file(mut self, name: impl Into<String>) -> Self {
        self.templates.push(name.into());
        self
    }

    /// Sets the creation time of every written file.
    #[must_use]
    pub fn created_at(mut self, created: DateTime<Utc>) -> Self {
        self.created = created;
        self
    }

    /// Agent id.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Directory holding the agent's files.
    pub fn agent_dir(&self) -> String {
        join(&self.root, &self.agent_id)
    }

    /// Path of the data manifest.
    pub fn data_manifest_path(&self) -> String {
        join(
            &self.agent_dir(),
            &format!("{DATA_MANIFEST_PREFIX}_{}", self.suffix),
        )
    }

    /// Path of the request manifest.
    pub fn request_manifest_path(&self) -> String {
        join(
            &self.agent_dir(),
            &format!("{REQUEST_MANIFEST_PREFIX}_{}", self.suffix),
        )
    }

    /// Path of a data file.
    pub fn data_file_path(&self, name: &str) -> String {
        join(&self.agent_dir(), name)
    }

    /// Tracking tag of a data file.
    pub fn tag(&self, name: &str) -> String {
        file_tag(&self.cosmos_tag, &self.agent_id, name)
    }

    /// Work item naming this manifest pair.
    pub fn file_set(&self) -> ManifestFileSet {
        ManifestFileSet {
            agent_id: self.agent_id.clone(),
            cosmos_tag: self.cosmos_tag.clone(),
            data_manifest_path: self.data_manifest_path(),
            request_manifest_path: self.request_manifest_path(),
        }
    }

    /// Writes the manifests and existing data files.
    pub fn write(&self, store: &TracingObjectStore) {
        self.write_data_manifest(store);
        store.put(
            &self.request_manifest_path(),
            self.commands.join("\n"),
            self.created,
        );
        for (name, size) in &self.files {
            store.put(&self.data_file_path(name), vec![b'x'; *size], self.created);
        }
    }

    /// Rewrites only the data manifest, e.g. after changing its templates.
    pub fn write_data_manifest(&self, store: &TracingObjectStore) {
        store.put(
            &self.data_manifest_path(),
            self.templates.join("\n"),
            self.created,
        );
    }
}
