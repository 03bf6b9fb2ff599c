pub mod encoding;
pub mod matcher;
pub mod transform;

pub use encoding::{Decoded, Detection, Encoding, EncodingError, EncodingResolver};
pub use matcher::{MatchOptions, PatternError, Replaced, SearchPattern};
pub use transform::SaveTransforms;

#[cfg(test)]
mod tests;
