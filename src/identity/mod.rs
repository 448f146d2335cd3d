/// Identifier resolution
///
/// Maps the free-text organizational names the remote system returns (faculty,
/// group, specialty, university) to canonical unit ids, learning remote-name
/// variants as it goes.
pub mod normalize;
pub mod resolver;

pub use normalize::{normalize, strip_modifiers};
pub use resolver::{IdentifierResolver, Resolution, UnitImport};
