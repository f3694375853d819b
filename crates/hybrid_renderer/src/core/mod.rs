//! Core renderer types shared by the application and the backend

pub mod config;
