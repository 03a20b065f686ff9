//! Recipient resolution: expands a logical target into concrete
//! (recipient, channel, address) destinations using a pluggable directory.

mod directory;
mod resolver;

pub use directory::{
    DirectoryError, DirectorySeed, InMemoryDirectory, RecipientDirectory, RecipientProfile,
};
pub use resolver::{RecipientResolver, ResolveError, ResolvedRecipient};
