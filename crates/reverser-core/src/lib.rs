//! GitOps Reverser: a Kubernetes control-plane component that captures
//! live API mutations and reflects them as Git commits.
//!
//! # Pipeline
//!
//! 1. An `AdmissionReview` arrives at the webhook server and is decoded by
//!    [`reverser_webhook::AdmissionHandler`], which consults the
//!    [`rules::RuleStore`] and sanitizes each match into a
//!    `CapturedEvent`.
//! 2. The [`router::EventRouter`] looks up which Branch Worker owns the
//!    event's Target and hands it off, recording a route miss if none
//!    does yet.
//! 3. The Branch Worker (`reverser-worker`) batches the event into a
//!    local commit and, per its Target's push policy, pushes to the
//!    remote.
//! 4. On a timer, the worker's Folder Reconciler (`reverser-reconciler`)
//!    diffs live cluster state against the repository and replays any
//!    drift through the same commit path, healing anything a missed
//!    webhook call or a route-miss window left behind.
//!
//! Target/Provider configuration is owned by [`reverser_controllers`]: two
//! level-triggered reconciliation loops that validate `GitProvider`/
//! `GitTarget` custom resources and register/unregister Targets with the
//! Event Router.
//!
//! # Key Types
//!
//! - [`assembly::Assembled`] — every long-lived component of one running
//!   process, built by [`assembly::assemble`].
//! - [`reverser_rules::RuleStore`] — the admission-path rule index.
//! - [`reverser_router::EventRouter`] — Target-to-worker routing plus
//!   dead-letter bookkeeping for route misses.
//! - [`reverser_controllers::ControllerContext`] — shared state the
//!   Target/Provider controllers read and write.
//!
//! # Modules
//!
//! - `logging` — `tracing-subscriber` bootstrap from `LoggingConfig`.
//! - `git_prober` — [`reverser_controllers::RepositoryProber`] backed by
//!   `git ls-remote`.
//! - `cluster_lister` — [`reverser_reconciler::ClusterLister`] backed by
//!   `kube`'s dynamic-object discovery and list API.
//! - `reconciler_factory` — builds a Target's Folder Reconciler from
//!   whatever `WatchRule`s the Rule Store currently has bound to it.
//! - `assembly` — wires the above into one [`assembly::Assembled`] system.
//!
//! # Stability
//!
//! Every lower crate (`reverser-types` through `reverser-controllers`) is
//! usable standalone; this crate only exists to assemble them. Expect its
//! wiring to shift as deployment needs change even when the lower crates'
//! APIs don't.
//!
//! # Usage
//!
//! Call [`assembly::assemble`] with a loaded [`reverser_config::AppConfig`]
//! and a `kube::Client`, mount [`assembly::admission_router`] behind TLS at
//! the path the cluster's `ValidatingWebhookConfiguration` points to, and
//! drive [`assembly::run_controllers`] alongside it. Binding the listener
//! and choosing a process supervision strategy is the embedding binary's
//! job, same as the webhook server itself leaves listener binding to its
//! caller.

pub mod assembly;
pub mod cluster_lister;
pub mod git_prober;
pub mod logging;
pub mod reconciler_factory;

pub use reverser_config as config;
pub use reverser_controllers as controllers;
pub use reverser_router as router;
pub use reverser_rules as rules;
pub use reverser_webhook as webhook;
