//! Exclusive ownership of shared media resources
//!
//! A capture device or a render surface feeds at most one binding at a time.
//! Rebinding swaps both directions of the table under a single lock, so the
//! previous owner stops receiving frames at the same instant the new owner
//! starts.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

use crate::publisher::PublishChannel;

/// Who currently draws into a render surface
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RenderOwner {
    /// Local preview of a publish channel
    Preview(PublishChannel),
    /// A remote play stream
    Play(String),
    /// A media player instance (arena index)
    MediaPlayer(usize),
}

struct BindingTable<R, O> {
    by_resource: HashMap<R, O>,
    by_owner: HashMap<O, R>,
}

/// Bidirectional resource ⇄ owner table
pub struct Bindings<R, O> {
    table: Mutex<BindingTable<R, O>>,
}

/// Outcome of a bind call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rebind<R, O> {
    /// Owner that lost the resource, if it was held by someone else
    pub displaced_owner: Option<O>,
    /// Resource the owner held before, if it moved
    pub released_resource: Option<R>,
}

impl<R, O> Bindings<R, O>
where
    R: Clone + Eq + Hash,
    O: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            table: Mutex::new(BindingTable {
                by_resource: HashMap::new(),
                by_owner: HashMap::new(),
            }),
        }
    }

    /// Bind `resource` to `owner`, taking it from any previous owner
    pub fn bind(&self, resource: R, owner: O) -> Rebind<R, O> {
        let mut table = self.table.lock();

        let released_resource = match table.by_owner.remove(&owner) {
            Some(previous) if previous != resource => {
                table.by_resource.remove(&previous);
                Some(previous)
            }
            _ => None,
        };

        let displaced_owner = match table.by_resource.insert(resource.clone(), owner.clone()) {
            Some(previous) if previous != owner => {
                table.by_owner.remove(&previous);
                Some(previous)
            }
            _ => None,
        };

        table.by_owner.insert(owner, resource);

        Rebind {
            displaced_owner,
            released_resource,
        }
    }

    /// Release whatever resource `owner` holds
    pub fn release_owner(&self, owner: &O) -> Option<R> {
        let mut table = self.table.lock();
        let resource = table.by_owner.remove(owner)?;
        table.by_resource.remove(&resource);
        Some(resource)
    }

    pub fn owner_of(&self, resource: &R) -> Option<O> {
        self.table.lock().by_resource.get(resource).cloned()
    }

    pub fn resource_of(&self, owner: &O) -> Option<R> {
        self.table.lock().by_owner.get(owner).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.lock().by_resource.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R, O> Default for Bindings<R, O>
where
    R: Clone + Eq + Hash,
    O: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
