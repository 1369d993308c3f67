pub mod capabilities;
pub mod security;
