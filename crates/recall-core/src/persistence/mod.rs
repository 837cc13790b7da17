pub mod service;
pub mod store;

pub use service::PersistenceService;
pub use store::ConversationStore;
