//! `carrier-pigeon` is a resilient publish pipeline for RabbitMQ, built on
//! top of [`lapin`], that keeps delivering through broker restarts and
//! network failures.
//!
//! [`PublishPipeline`](crate::pipeline::PublishPipeline) is the best starting
//! point to learn what the crate provides and how to leverage it: a
//! self-healing connection, a fixed-size pool of independently re-opening
//! channels, a bounded publish queue with backpressure, and optional
//! broker-confirmed publishing.

pub mod amqp;
pub mod pipeline;
