pub mod children;
pub mod model;
pub mod repository;
pub mod service;
