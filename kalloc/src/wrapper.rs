//! OOM wrapper functions.

use core::hash::Hash;

pub use alloc::{
    collections::{TryReserveError, VecDeque},
    vec::Vec,
};
pub use hashbrown::HashMap;

/// Error returned when a reservation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

/// Map [TryReserveError] to [AllocError] for consistency.
pub fn r2a<T>(r: Result<T, TryReserveError>) -> Result<T, AllocError> {
    r.map_err(|_| AllocError)
}

/// OOM wrapper to push back an element into a vector. Amortized O(1).
pub fn vec_push<T>(v: &mut Vec<T>, x: T) -> Result<(), AllocError> {
    r2a(v.try_reserve(1))?;
    v.push(x);
    Ok(())
}

/// OOM wrapper to push back an element to a deque.
pub fn deque_push_back<T>(v: &mut VecDeque<T>, x: T) -> Result<(), AllocError> {
    r2a(v.try_reserve(1))?;
    v.push_back(x);
    Ok(())
}

/// OOM wrapper to insert a key-value pair into a hash map.
pub fn map_insert<K: Eq + Hash, V>(
    m: &mut HashMap<K, V>,
    k: K,
    v: V,
) -> Result<Option<V>, AllocError> {
    m.try_reserve(1).map_err(|_| AllocError)?;
    Ok(m.insert(k, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_push() {
        let mut v = Vec::new();
        for i in 0..100 {
            vec_push(&mut v, i).unwrap();
        }
        assert_eq!(v.len(), 100);
    }

    #[test]
    fn test_map_insert() {
        let mut m = HashMap::new();
        assert_eq!(map_insert(&mut m, 1, "one").unwrap(), None);
        assert_eq!(map_insert(&mut m, 1, "uno").unwrap(), Some("one"));
    }
}
