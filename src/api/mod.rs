// HTTP trigger and write surface
pub mod handler;
pub mod models;
