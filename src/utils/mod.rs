/// Credentials from `.env` files
pub mod env;

/// Hugging Face utilities
pub mod hugging_face;
