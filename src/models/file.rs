//! Attachment metadata

use super::{Bind, Model};
use serde::{Deserialize, Serialize};

/// Metadata for an attachment whose bytes live on disk under the files
/// directory. The id is hashed from the owning message and the part's
/// most stable discriminator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,

    pub message_id: String,
    pub filename: String,
    #[serde(default)]
    pub part_id: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub size: i64,
    /// Content-ID for inline parts referenced from the HTML body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
}

impl File {
    pub fn new(
        account_id: &str,
        message_id: &str,
        filename: &str,
        part_id: &str,
        content_type: &str,
        size: i64,
    ) -> Self {
        // Part id is the preferred discriminator; fall back to the
        // filename so two unnamed parts of one message stay distinct.
        let discriminator = if !part_id.is_empty() { part_id } else { filename };
        File {
            id: crate::util::id_for_file(message_id, discriminator),
            account_id: account_id.to_string(),
            version: 0,
            message_id: message_id.to_string(),
            filename: filename.to_string(),
            part_id: part_id.to_string(),
            content_type: content_type.to_string(),
            size,
            content_id: None,
        }
    }

    pub fn is_inline(&self) -> bool {
        self.content_id.is_some()
    }

    pub fn safe_filename(&self) -> String {
        crate::util::safe_filename(&self.filename)
    }
}

impl Model for File {
    fn table() -> &'static str {
        "File"
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn index_columns() -> &'static [&'static str] {
        &["messageId", "filename"]
    }

    fn index_values(&self) -> Vec<Bind> {
        vec![
            Bind::Text(self.message_id.clone()),
            Bind::Text(self.filename.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_differ_across_parts_of_one_message() {
        let a = File::new("acct", "m1", "a.pdf", "1.1", "application/pdf", 10);
        let b = File::new("acct", "m1", "b.pdf", "1.2", "application/pdf", 10);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn filename_discriminates_when_part_id_missing() {
        let a = File::new("acct", "m1", "a.pdf", "", "application/pdf", 10);
        let b = File::new("acct", "m1", "b.pdf", "", "application/pdf", 10);
        assert_ne!(a.id, b.id);
    }
}
