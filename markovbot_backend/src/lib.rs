pub mod commands;
pub mod config;
pub mod corpus;
pub mod database;
pub mod deathmatch;
pub mod fun;
pub mod http_client;
pub mod ingest;
pub mod markov;
pub mod names;
pub mod publisher;
pub mod roster;
pub mod runtime;
pub mod server;
pub mod simulator;
pub mod telegram;
