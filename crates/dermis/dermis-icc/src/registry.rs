//! Named resource registry.
//!
//! Every shared region, slot lock and gate semaphore is created and attached
//! by name. Names are reference counted: `alloc` and each `attach` take a
//! reference, `free` drops one, and the last `free` releases the resource and
//! invalidates it so that anyone still blocked on it wakes up with an error.

use dermis_mmap::SharedMap;
use dermis_rt::{Semaphore, TimedRwLock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("name `{0}` is already taken")]
    Busy(String),
    #[error("no resource named `{0}`")]
    Absent(String),
    #[error("resource `{0}` is of a different kind")]
    WrongKind(String),
    #[error("failed to map shared region: {0}")]
    Mmap(#[from] io::Error),
}

impl From<RegistryError> for dermis_types::Error {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Busy(_) | RegistryError::WrongKind(_) => Self::BadName,
            RegistryError::Absent(_) => Self::Fail,
            RegistryError::Mmap(_) => Self::NoMem,
        }
    }
}

/// Namespace of shared regions and named synchronization objects.
pub trait ResourceRegistry: Send + Sync {
    fn alloc(&self, name: &str, size: usize) -> Result<Arc<SharedMap>, RegistryError>;
    fn attach(&self, name: &str) -> Result<Arc<SharedMap>, RegistryError>;

    fn alloc_rwlock(&self, name: &str) -> Result<Arc<TimedRwLock>, RegistryError>;
    fn attach_rwlock(&self, name: &str) -> Result<Arc<TimedRwLock>, RegistryError>;

    fn alloc_semaphore(&self, name: &str, initial: u64) -> Result<Arc<Semaphore>, RegistryError>;
    fn attach_semaphore(&self, name: &str) -> Result<Arc<Semaphore>, RegistryError>;

    /// Drop one reference; the last one releases the resource.
    fn free(&self, name: &str);

    fn name_available(&self, name: &str) -> bool;

    /// Forcibly release `name` regardless of outstanding references.
    ///
    /// Returns whether anything was reclaimed.
    fn make_available(&self, name: &str) -> bool;

    /// Names currently registered under `prefix`.
    fn names_with_prefix(&self, prefix: &str) -> Vec<String>;
}

#[derive(Clone)]
enum Resource {
    Region(Arc<SharedMap>),
    RwLock(Arc<TimedRwLock>),
    Semaphore(Arc<Semaphore>),
}

impl Resource {
    fn invalidate(&self) {
        match self {
            Resource::Region(_) => {}
            Resource::RwLock(l) => l.invalidate(),
            Resource::Semaphore(s) => s.invalidate(),
        }
    }
}

struct Entry {
    resource: Resource,
    refs: u32,
}

/// In-process registry; regions are anonymous mappings.
#[derive(Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ProcessRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn insert(&self, name: &str, make: impl FnOnce() -> io::Result<Resource>) -> Result<Resource, RegistryError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(name) {
            return Err(RegistryError::Busy(name.to_owned()));
        }
        let resource = make()?;
        entries.insert(
            name.to_owned(),
            Entry {
                resource: resource.clone(),
                refs: 1,
            },
        );
        debug!(name, "registry alloc");
        Ok(resource)
    }

    fn get(&self, name: &str) -> Result<Resource, RegistryError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| RegistryError::Absent(name.to_owned()))?;
        entry.refs += 1;
        Ok(entry.resource.clone())
    }

    fn unget(&self, name: &str) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.refs -= 1;
        }
    }
}

macro_rules! typed_attach {
    ($self:ident, $name:ident, $variant:ident) => {
        match $self.get($name)? {
            Resource::$variant(r) => Ok(r),
            _ => {
                $self.unget($name);
                Err(RegistryError::WrongKind($name.to_owned()))
            }
        }
    };
}

impl ResourceRegistry for ProcessRegistry {
    fn alloc(&self, name: &str, size: usize) -> Result<Arc<SharedMap>, RegistryError> {
        match self.insert(name, || Ok(Resource::Region(Arc::new(SharedMap::anonymous(size)?))))? {
            Resource::Region(m) => Ok(m),
            _ => Err(RegistryError::WrongKind(name.to_owned())),
        }
    }

    fn attach(&self, name: &str) -> Result<Arc<SharedMap>, RegistryError> {
        typed_attach!(self, name, Region)
    }

    fn alloc_rwlock(&self, name: &str) -> Result<Arc<TimedRwLock>, RegistryError> {
        match self.insert(name, || Ok(Resource::RwLock(TimedRwLock::new(name))))? {
            Resource::RwLock(l) => Ok(l),
            _ => Err(RegistryError::WrongKind(name.to_owned())),
        }
    }

    fn attach_rwlock(&self, name: &str) -> Result<Arc<TimedRwLock>, RegistryError> {
        typed_attach!(self, name, RwLock)
    }

    fn alloc_semaphore(&self, name: &str, initial: u64) -> Result<Arc<Semaphore>, RegistryError> {
        match self.insert(name, || Ok(Resource::Semaphore(Semaphore::new(name, initial))))? {
            Resource::Semaphore(s) => Ok(s),
            _ => Err(RegistryError::WrongKind(name.to_owned())),
        }
    }

    fn attach_semaphore(&self, name: &str) -> Result<Arc<Semaphore>, RegistryError> {
        typed_attach!(self, name, Semaphore)
    }

    fn free(&self, name: &str) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(name) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0
            && let Some(entry) = entries.remove(name)
        {
            entry.resource.invalidate();
            debug!(name, "registry release");
        }
    }

    fn name_available(&self, name: &str) -> bool {
        !self.entries.lock().contains_key(name)
    }

    fn make_available(&self, name: &str) -> bool {
        match self.entries.lock().remove(name) {
            Some(entry) => {
                entry.resource.invalidate();
                true
            }
            None => false,
        }
    }

    fn names_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}
