pub mod node;
pub mod route;
pub mod resolver;
