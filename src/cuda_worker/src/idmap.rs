use std::collections::{hash_map::Iter, HashMap, TryReserveError};

/// Map handing out increasing ids; ids are never reused.
#[derive(Debug)]
pub(crate) struct IdMap<T> {
    inner: HashMap<usize, T>,
    cursor: usize,
}

impl<T> IdMap<T> {
    pub fn new() -> Self {
        IdMap {
            inner: HashMap::new(),
            cursor: 0,
        }
    }

    pub fn insert(&mut self, item: T) -> usize {
        let id = self.cursor;
        self.inner.insert(id, item);
        self.cursor += 1;
        id
    }

    /// Insert, reserving entry storage up front so exhaustion is reported instead of aborting.
    pub fn try_insert(&mut self, item: T) -> Result<usize, TryReserveError> {
        self.inner.try_reserve(1)?;
        Ok(self.insert(item))
    }

    pub fn remove(&mut self, id: usize) -> Option<T> {
        self.inner.remove(&id)
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.inner.get(&id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.inner.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn iter(&self) -> Iter<'_, usize, T> {
        self.inner.iter()
    }
}

impl<T> Default for IdMap<T> {
    fn default() -> Self {
        IdMap::new()
    }
}

impl<'a, T> IntoIterator for &'a IdMap<T> {
    type Item = (&'a usize, &'a T);
    type IntoIter = Iter<'a, usize, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}
