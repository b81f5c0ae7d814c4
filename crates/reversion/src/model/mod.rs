//! Model components: the trainable token-embedding table, the latent
//! discriminator, the frozen collaborator traits, and tensor bridge helpers.

pub mod bridge;
pub mod collaborators;
pub mod discriminator;
pub mod embedding;
