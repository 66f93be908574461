//! swarmgit-core: identifiers, wire framing, protocol records, signing and config.
//! All other Swarmgit crates depend on this one.

pub mod config;
pub mod crypto;
pub mod message;
pub mod object;
pub mod wire;

pub use config::SwarmgitConfig;
pub use crypto::{Address, Keypair};
pub use object::{CheckoutType, ManifestObject, ManifestObjectSet, ManifestObjects, ObjectId, ObjectKind};
pub use wire::{Decode, Encode, Protocol, WireError};
