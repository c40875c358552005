//! Folder vs. label classification of mailbox paths

use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;

/// Prefixes that split the mailbox namespace into folders and labels
///
/// An empty prefix counts as not configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingPolicy {
    #[serde(default)]
    pub folder_prefix: String,
    #[serde(default)]
    pub labels_prefix: String,
}

impl NamingPolicy {
    pub fn new(folder_prefix: impl Into<String>, labels_prefix: impl Into<String>) -> Self {
        Self {
            folder_prefix: folder_prefix.into(),
            labels_prefix: labels_prefix.into(),
        }
    }

    /// Decide whether a mailbox path is an exclusive folder
    ///
    /// With both prefixes configured the first segment must match one of
    /// them. With only one configured, a path is claimed by it only when it
    /// has more than one segment.
    pub fn validate_name(&self, path: &[String]) -> Result<bool, ConnectorError> {
        let first = path.first().map(String::as_str);
        let folder = (!self.folder_prefix.is_empty()).then_some(self.folder_prefix.as_str());
        let labels = (!self.labels_prefix.is_empty()).then_some(self.labels_prefix.as_str());

        match (folder, labels) {
            (None, None) => Ok(false),
            (Some(f), Some(l)) => {
                if first == Some(f) {
                    Ok(true)
                } else if first == Some(l) {
                    Ok(false)
                } else {
                    Err(ConnectorError::InvalidPrefix {
                        expected: format!("{} or {}", f, l),
                    })
                }
            }
            (Some(f), None) => Ok(path.len() > 1 && first == Some(f)),
            // Labels are never exclusive, so a match and a miss agree here
            (None, Some(_)) => Ok(false),
        }
    }
}
