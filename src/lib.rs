#![doc = include_str!("../README.md")]

pub mod identity;
pub mod sync;
pub mod weak;

mod raw;

#[cfg(feature = "rayon")]
mod rayon_impls;
#[cfg(feature = "serde")]
mod serde_impls;

pub use identity::IdentityMap;
#[cfg(feature = "rayon")]
pub use rayon_impls::ParIter;
pub use sync::{OccupiedError, SyncTable, SyncTableBuilder};
pub use weak::{KeyHandle, WeakKeyMap, WeakKeyMapBuilder};
