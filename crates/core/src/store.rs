//! Context-owned observable state for the public-link pages.
//!
//! A [`Store`] has exactly one owner that mutates it through setters; readers
//! hold a `watch::Receiver` and are notified of every change.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::protocol::FileType;

#[derive(Debug)]
pub struct Store<T> {
    tx: watch::Sender<T>,
}

impl<T: Default> Default for Store<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Store<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Replaces the value and notifies subscribers.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Mutates the value in place and notifies subscribers.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Store<T> {
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub uuid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub size: u64,
    #[serde(default)]
    pub mime: String,
    #[serde(default)]
    pub last_modified: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordState {
    pub uuid: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaltedPasswordState {
    pub uuid: String,
    pub password: String,
    pub salt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryPublicLinkState {
    pub items: Vec<DriveItem>,
    pub search_term: String,
    #[serde(rename = "virtualURL")]
    pub virtual_url: String,
    pub password_state: PasswordState,
    pub download_btn: bool,
}

impl DirectoryPublicLinkState {
    /// Items whose name contains the search term, ignoring case. An empty
    /// (or blank) term matches everything.
    pub fn filtered_items(&self) -> Vec<&DriveItem> {
        let term = self.search_term.trim().to_lowercase();
        if term.is_empty() {
            return self.items.iter().collect();
        }
        self.items
            .iter()
            .filter(|item| item.name.to_lowercase().contains(&term))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicLinkState {
    pub password_state: SaltedPasswordState,
}

pub type DirectoryPublicLinkStore = Store<DirectoryPublicLinkState>;
pub type PublicLinkStore = Store<PublicLinkState>;

impl Store<DirectoryPublicLinkState> {
    pub fn set_items(&self, items: Vec<DriveItem>) {
        self.update(|s| s.items = items);
    }

    pub fn update_items(&self, f: impl FnOnce(&mut Vec<DriveItem>)) {
        self.update(|s| f(&mut s.items));
    }

    pub fn set_search_term(&self, term: impl Into<String>) {
        let term = term.into();
        self.update(|s| s.search_term = term);
    }

    pub fn set_virtual_url(&self, url: impl Into<String>) {
        let url = url.into();
        self.update(|s| s.virtual_url = url);
    }

    pub fn set_password_state(&self, password_state: PasswordState) {
        self.update(|s| s.password_state = password_state);
    }

    pub fn set_download_btn(&self, visible: bool) {
        self.update(|s| s.download_btn = visible);
    }
}

impl Store<PublicLinkState> {
    pub fn set_password_state(&self, password_state: SaltedPasswordState) {
        self.update(|s| s.password_state = password_state);
    }

    pub fn update_password_state(&self, f: impl FnOnce(&mut SaltedPasswordState)) {
        self.update(|s| f(&mut s.password_state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str) -> DriveItem {
        DriveItem {
            uuid: format!("{name}-uuid"),
            name: name.to_string(),
            file_type: FileType::File,
            size: 1,
            mime: String::new(),
            last_modified: 0,
        }
    }

    #[test]
    fn subscribers_see_every_setter() {
        let store = DirectoryPublicLinkStore::default();
        let mut rx = store.subscribe();
        assert!(!rx.has_changed().unwrap());

        store.set_items(vec![item("Holiday.JPG"), item("notes.txt")]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().items.len(), 2);

        store.set_search_term("jpg");
        assert!(rx.has_changed().unwrap());
        let names: Vec<String> = rx
            .borrow_and_update()
            .filtered_items()
            .into_iter()
            .map(|i| i.name.clone())
            .collect();
        assert_eq!(names, vec!["Holiday.JPG".to_string()]);

        store.set_download_btn(true);
        assert!(store.get().download_btn);
    }

    #[test]
    fn update_items_works_from_previous_value() {
        let store = DirectoryPublicLinkStore::default();
        store.set_items(vec![item("a")]);
        store.update_items(|items| items.push(item("b")));
        assert_eq!(store.with(|s| s.items.len()), 2);
    }

    #[test]
    fn blank_search_term_matches_everything() {
        let store = DirectoryPublicLinkStore::default();
        store.set_items(vec![item("a"), item("b")]);
        store.set_search_term("   ");
        assert_eq!(store.with(|s| s.filtered_items().len()), 2);
    }

    #[test]
    fn stores_are_independent_instances() {
        let first = PublicLinkStore::default();
        let second = PublicLinkStore::default();
        first.update_password_state(|p| p.salt = "s1".to_string());
        assert_eq!(first.get().password_state.salt, "s1");
        assert_eq!(second.get().password_state.salt, "");
    }

    #[tokio::test]
    async fn subscriber_wakes_on_change() {
        let store = PublicLinkStore::default();
        let mut rx = store.subscribe();
        assert_eq!(store.subscriber_count(), 1);

        let waiter = tokio::spawn(async move {
            rx.changed().await.unwrap();
            rx.borrow().password_state.uuid.clone()
        });

        store.set_password_state(SaltedPasswordState {
            uuid: "link-1".to_string(),
            password: "pw".to_string(),
            salt: "salt".to_string(),
        });

        assert_eq!(waiter.await.unwrap(), "link-1");
    }
}
