//! Content catalog types and collaborator interfaces.
//!
//! The catalog itself (listing published content) and URL resolution live
//! outside this crate; they are consumed through [`CatalogService`] and
//! [`ContentResolver`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a published item is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Static site or document uploaded as-is
    Static,
    /// Document rendered from source (notebook, report)
    Rendered,
    /// Interactive application
    Interactive,
    /// API endpoint
    Api,
}

impl ContentKind {
    /// Only static and rendered output has markup that can be extracted.
    pub fn is_renderable(&self) -> bool {
        matches!(self, Self::Static | Self::Rendered)
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static => write!(f, "static"),
            Self::Rendered => write!(f, "rendered"),
            Self::Interactive => write!(f, "interactive"),
            Self::Api => write!(f, "api"),
        }
    }
}

/// A selectable content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    /// Stable identifier (opaque)
    pub id: String,
    /// Display title
    pub title: String,
    /// Owner username
    pub owner: String,
    /// Content kind
    pub kind: ContentKind,
    /// When the item was last deployed
    pub last_deployed: DateTime<Utc>,
}

impl ContentRef {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        owner: impl Into<String>,
        kind: ContentKind,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            owner: owner.into(),
            kind,
            last_deployed: Utc::now(),
        }
    }

    pub fn with_last_deployed(mut self, at: DateTime<Utc>) -> Self {
        self.last_deployed = at;
        self
    }

    /// Label shown in a content picker.
    pub fn display_label(&self) -> String {
        let title = if self.title.trim().is_empty() {
            self.id.as_str()
        } else {
            self.title.as_str()
        };
        format!("{} by {}", title, self.owner)
    }
}

/// Keep only items whose markup can be extracted, newest deployment first.
pub fn filter_renderable(items: impl IntoIterator<Item = ContentRef>) -> Vec<ContentRef> {
    let mut items: Vec<ContentRef> = items
        .into_iter()
        .filter(|item| item.kind.is_renderable())
        .collect();
    items.sort_by(|a, b| b.last_deployed.cmp(&a.last_deployed));
    items
}

/// Source of selectable content.
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// List every content item visible to the user.
    async fn list_content(&self) -> Result<Vec<ContentRef>>;

    /// List content restricted to renderable kinds.
    async fn list_renderable(&self) -> Result<Vec<ContentRef>> {
        Ok(filter_renderable(self.list_content().await?))
    }
}

/// Maps a content item to the URL its rendered output is served from.
pub trait ContentResolver: Send + Sync {
    fn resolve_url(&self, content: &ContentRef) -> Result<Url>;
}

/// Resolves `{base}/content/{id}/`.
#[derive(Debug, Clone)]
pub struct BaseUrlResolver {
    base: Url,
}

impl BaseUrlResolver {
    pub fn new(base: &str) -> Result<Self> {
        let mut base =
            Url::parse(base).map_err(|e| Error::Config(format!("invalid base URL {base}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { base })
    }
}

/// Whether `id` can be used verbatim as one URL path segment.
fn is_path_segment(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '?', '#', '%'])
}

impl ContentResolver for BaseUrlResolver {
    fn resolve_url(&self, content: &ContentRef) -> Result<Url> {
        if !is_path_segment(&content.id) {
            return Err(Error::Config(format!(
                "content id {:?} cannot be used in a URL path",
                content.id
            )));
        }
        self.base
            .join(&format!("content/{}/", content.id))
            .map_err(|e| Error::Config(format!("cannot resolve content URL: {e}")))
    }
}
