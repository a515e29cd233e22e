use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::lock;

pub trait Navigator: Send + Sync {
    fn navigate_to(&self, path: &str, params: &[(&str, String)]);
    fn route_param(&self, name: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub header: String,
    pub message: String,
    pub accept_label: String,
    pub reject_label: String,
}

impl ConfirmRequest {
    pub fn discard_changes() -> Self {
        Self {
            header: "Cancel Edit".into(),
            message: "Discard all changes?".into(),
            accept_label: "Yes".into(),
            reject_label: "No".into(),
        }
    }
}

/// Confirmation and alert dialogs. Resolves once the user decided.
#[async_trait]
pub trait Dialogs: Send + Sync {
    async fn confirm(&self, request: ConfirmRequest) -> bool;
    async fn alert(&self, message: &str);
}

/// Opaque registration of "unsaved changes exist".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NavigationGuardToken(Uuid);

impl NavigationGuardToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NavigationGuardToken {
    fn default() -> Self {
        Self::new()
    }
}

pub trait PageExitGuard: Send + Sync {
    fn add(&self) -> NavigationGuardToken;
    fn remove(&self, token: NavigationGuardToken);
}

/// In-process page exit registry.
#[derive(Default)]
pub struct PageExitVerification {
    tokens: Mutex<HashSet<NavigationGuardToken>>,
}

impl PageExitVerification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_pending(&self) -> bool {
        !lock(&self.tokens).is_empty()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.tokens).len()
    }
}

impl PageExitGuard for PageExitVerification {
    fn add(&self) -> NavigationGuardToken {
        let token = NavigationGuardToken::new();
        lock(&self.tokens).insert(token);
        debug!("page exit verification added");
        token
    }

    fn remove(&self, token: NavigationGuardToken) {
        if lock(&self.tokens).remove(&token) {
            debug!("page exit verification removed");
        }
    }
}

pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
}

#[derive(Default)]
pub struct MemoryPreferences {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        lock(&self.values).insert(key.to_string(), value);
    }
}

/// One-shot payload a list view leaves behind for the "new" editor to pick up.
pub trait CreationHandoff<T>: Send + Sync {
    fn take_pending(&self) -> Option<T>;
}

pub struct PendingCreation<T> {
    pending: Mutex<Option<T>>,
}

impl<T> Default for PendingCreation<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(None),
        }
    }
}

impl<T> PendingCreation<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any payload that was not picked up yet.
    pub fn offer(&self, value: T) {
        *lock(&self.pending) = Some(value);
    }
}

impl<T: Send> CreationHandoff<T> for PendingCreation<T> {
    fn take_pending(&self) -> Option<T> {
        lock(&self.pending).take()
    }
}

pub struct EditorCollaborators<T> {
    pub navigator: Arc<dyn Navigator>,
    pub dialogs: Arc<dyn Dialogs>,
    pub exit_guard: Arc<dyn PageExitGuard>,
    pub creation: Arc<dyn CreationHandoff<T>>,
}

impl<T> Clone for EditorCollaborators<T> {
    fn clone(&self) -> Self {
        Self {
            navigator: Arc::clone(&self.navigator),
            dialogs: Arc::clone(&self.dialogs),
            exit_guard: Arc::clone(&self.exit_guard),
            creation: Arc::clone(&self.creation),
        }
    }
}
