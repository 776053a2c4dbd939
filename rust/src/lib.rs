pub mod bootstrap;
pub mod collab;
pub mod jwt;
