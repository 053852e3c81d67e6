pub mod auth;
pub mod chats;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod notify;
pub mod otp;
pub mod profile;
pub mod response;
pub mod routes;
pub mod socket;
pub mod state;
pub mod storage;
pub mod validation;
