//! # Transcription Server Library
//!
//! Core of the local speech-to-text service: streaming sessions, long-audio
//! segmentation, the recognition pipeline, transcript post-processing and
//! the job queue, fronted by an HTTP/WebSocket surface.
//!
//! ## Architecture
//!
//! - [`audio`] - canonical PCM handling, WAV framing, upload decoding
//! - [`segmenter`] - fixed / VAD / hybrid chunking of long audio
//! - [`recognizer`] - the recognizer capability and its adapter
//! - [`pipeline`] - ordered per-segment recognition with progress and cancel
//! - [`merge`] - simple / overlap / smart transcript merging
//! - [`postprocess`] - mode- and profile-driven transcript cleanup
//! - [`dictionary`] - personal spoken-to-written replacements
//! - [`session`] - interactive session state machine and reaper
//! - [`jobs`] - bounded async job queue for long uploads
//! - [`enhancer`] - optional LLM polish, strictly best-effort
//! - [`server`] - axum routes, WebSocket protocol, rate limiting, auth
//!
//! The recognizer model and the LLM enhancer are external collaborators;
//! the crate sees them only through the capability traits in [`recognizer`]
//! and [`enhancer`], injected at boot.

pub mod audio;
pub mod config;
pub mod dictionary;
pub mod enhancer;
pub mod error;
pub mod jobs;
pub mod merge;
pub mod pipeline;
pub mod postprocess;
pub mod recognizer;
pub mod segmenter;
pub mod server;
pub mod session;
