//! Contacts, address books, and contact groups

use super::{Bind, Model};
use serde::{Deserialize, Serialize};

pub const CONTACT_SOURCE_CARDDAV: &str = "carddav";
pub const CONTACT_SOURCE_MAIL: &str = "mail";

/// A CardDAV address-book handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactBook {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,

    pub url: String,
    pub source: String,
    /// Collection tag; changes whenever the collection's contents change.
    #[serde(default)]
    pub ctag: String,
    /// RFC 6578 opaque cursor; empty before the first sync-collection.
    #[serde(default)]
    pub sync_token: String,
}

impl ContactBook {
    pub fn new(account_id: &str, url: &str) -> Self {
        ContactBook {
            id: format!("{}-default", account_id),
            account_id: account_id.to_string(),
            version: 0,
            url: url.to_string(),
            source: CONTACT_SOURCE_CARDDAV.to_string(),
            ctag: String::new(),
            sync_token: String::new(),
        }
    }
}

impl Model for ContactBook {
    fn table() -> &'static str {
        "ContactBook"
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
}

/// Extra payload carried by a contact: the raw vCard and its href for
/// CardDAV contacts, or provider JSON otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ContactInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vcf: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub href: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,

    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    pub source: String,
    /// Refcount for mail-harvested contacts; how many messages mention
    /// this address.
    #[serde(default)]
    pub refs: i64,
    /// Group carrier-contacts are hidden from the address list.
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub book_id: String,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub info: Option<ContactInfo>,
}

impl Model for Contact {
    fn table() -> &'static str {
        "Contact"
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
        &["email", "bookId", "hidden", "source", "etag", "refs"]
    }

    fn index_values(&self) -> Vec<Bind> {
        vec![
            Bind::Text(self.email.clone()),
            Bind::Text(self.book_id.clone()),
            Bind::Int(self.hidden as i64),
            Bind::Text(self.source.clone()),
            Bind::Text(self.etag.clone()),
            Bind::Int(self.refs),
        ]
    }

    fn supports_metadata() -> bool {
        true
    }
}

/// A named membership set projected from a group carrier-contact's vCard.
/// Membership lives in a relation table maintained on save.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactGroup {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,

    pub name: String,
    #[serde(default)]
    pub book_id: String,
}

impl Model for ContactGroup {
    fn table() -> &'static str {
        "ContactGroup"
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
        &["bookId", "name"]
    }

    fn index_values(&self) -> Vec<Bind> {
        vec![Bind::Text(self.book_id.clone()), Bind::Text(self.name.clone())]
    }
}
