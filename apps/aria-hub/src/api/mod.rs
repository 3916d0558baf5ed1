pub mod cache;
pub mod capabilities;
pub mod discovery;
pub mod meta;
pub mod pipeline;
pub mod shadow;
