use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinator::CoordinatorSettings;
use crate::fetch::{FetchSettings, DEFAULT_USER_AGENT};
use crate::webbook::DEFAULT_MAX_PAGES;

/// Engine configuration. Every field has a default, so a partial file only
/// overrides what it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage_dir: PathBuf,
    pub concurrency: usize,
    pub search_size: usize,
    pub refresh_size: usize,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub redirect_limit: usize,
    pub max_body_bytes: u64,
    pub user_agent: String,
    pub max_content_pages: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("storage"),
            concurrency: 24,
            search_size: 50,
            refresh_size: 30,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            redirect_limit: 5,
            max_body_bytes: 8 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_content_pages: DEFAULT_MAX_PAGES,
        }
    }
}

impl EngineConfig {
    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            redirect_limit: self.redirect_limit,
            max_bytes: self.max_body_bytes,
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            concurrency: self.concurrency.max(1),
            search_size: self.search_size.max(1),
            refresh_size: self.refresh_size.max(1),
        }
    }
}
