//! The workers engine.
//!
//! Runs compute jobs and interactive apps on the cluster, drives image
//! builds through GitHub Actions and relays results to the upstream webapp.

pub mod api;
pub mod builds;
pub mod cluster;
pub mod db;
pub mod deployments;
pub mod github;
pub mod jobs;
pub mod logs;
pub mod manifests;
pub mod models;
pub mod projects;
pub mod relay;
pub mod resources;
pub mod secrets;
pub mod server;

#[cfg(test)]
pub mod fakes;
