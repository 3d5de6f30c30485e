//! Emergency contact book, persisted under a single store key.
//!
//! Capped at five. Load and save failures are logged and never surface to the caller: a
//! broken store reads as an empty book, and an unsaved edit still applies in memory.

use std::sync::Mutex;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ContactError;
use crate::lock;
use crate::shared::Contact;
use crate::store::TypedStore;

pub const CONTACTS_KEY: &str = "sentinelnet_emergency_contacts";
pub const MAX_CONTACTS: usize = 5;

static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\d\s\-+()]{7,15}$").expect("valid phone regex"));

pub struct ContactBook {
    store: TypedStore,
    contacts: Mutex<Vec<Contact>>,
}

impl ContactBook {
    pub fn open(store: TypedStore) -> Self {
        let mut contacts = match store.get_json::<Vec<Contact>>(CONTACTS_KEY) {
            Ok(found) => found.unwrap_or_default(),
            Err(e) => {
                tracing::error!(target: "sentinel::store", "failed to load contacts: {}", e);
                Vec::new()
            }
        };
        contacts.truncate(MAX_CONTACTS);
        Self {
            store,
            contacts: Mutex::new(contacts),
        }
    }

    fn save(&self, contacts: &[Contact]) {
        if let Err(e) = self.store.put_json(CONTACTS_KEY, &contacts) {
            tracing::error!(target: "sentinel::store", "failed to save contacts: {}", e);
        }
    }

    pub fn add(&self, name: &str, phone: &str) -> Result<Contact, ContactError> {
        let name = name.trim();
        let phone = phone.trim();
        let mut contacts = lock(&self.contacts);
        if contacts.len() >= MAX_CONTACTS {
            return Err(ContactError::Full(MAX_CONTACTS));
        }
        if name.is_empty() || phone.is_empty() {
            return Err(ContactError::MissingField);
        }
        if !PHONE_RE.is_match(phone) {
            return Err(ContactError::InvalidPhone(phone.to_string()));
        }

        let contact = Contact {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            phone: phone.to_string(),
            created_at: Utc::now(),
        };
        contacts.push(contact.clone());
        self.save(&contacts);
        tracing::info!(target: "sentinel::session", name = %contact.name, total = contacts.len(), "contact added");
        Ok(contact)
    }

    pub fn remove(&self, id: &str) -> Result<Contact, ContactError> {
        let mut contacts = lock(&self.contacts);
        let idx = contacts
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| ContactError::NotFound(id.to_string()))?;
        let removed = contacts.remove(idx);
        self.save(&contacts);
        tracing::info!(target: "sentinel::session", remaining = contacts.len(), "contact removed");
        Ok(removed)
    }

    /// Blank or missing fields keep their old values.
    pub fn update(&self, id: &str, name: Option<&str>, phone: Option<&str>) -> Result<Contact, ContactError> {
        let name = name.map(str::trim).filter(|s| !s.is_empty());
        let phone = phone.map(str::trim).filter(|s| !s.is_empty());
        if let Some(p) = phone {
            if !PHONE_RE.is_match(p) {
                return Err(ContactError::InvalidPhone(p.to_string()));
            }
        }

        let mut contacts = lock(&self.contacts);
        let contact = contacts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ContactError::NotFound(id.to_string()))?;
        if let Some(n) = name {
            contact.name = n.to_string();
        }
        if let Some(p) = phone {
            contact.phone = p.to_string();
        }
        let updated = contact.clone();
        self.save(&contacts);
        Ok(updated)
    }

    pub fn list(&self) -> Vec<Contact> {
        lock(&self.contacts).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.contacts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn can_add_more(&self) -> bool {
        self.len() < MAX_CONTACTS
    }
}
