pub mod admin;
pub mod auth;
pub mod cookies;
pub mod events;
pub mod jobs;
pub mod library;
pub mod uploads;
