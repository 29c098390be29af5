pub mod agent;
pub mod errors;
pub mod federation;
pub mod memory;
pub mod model_client;
pub mod models;
pub mod prompt_template;
pub mod providers;
pub mod record;
pub mod retry;
pub mod session;
pub mod token_counter;
pub mod tool;
