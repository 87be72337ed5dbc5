pub mod admin;
pub mod attendance;
pub mod auth;
pub mod badges;
pub mod chat;
pub mod core;
pub mod courses;
pub mod marks;
pub mod prefs;
pub mod reports;
pub mod users;
