pub mod collaborators;
pub mod errors;
pub mod events;
pub mod ids;
pub mod intent;
pub mod plan;
pub mod query;
pub mod text;
pub mod timeout;
