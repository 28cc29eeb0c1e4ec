pub mod firestore;
pub mod openrouter;
