pub mod assembler;
pub mod capability;
pub mod digest;
pub mod dispatcher;
pub mod engine;
pub mod llm;
pub mod markup;
pub mod outline;
pub mod retry;
pub mod structured;
pub mod transcript;
pub mod tts;
