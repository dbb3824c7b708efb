// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Spool lifecycle.
//!
//! The [`Spool`] owns the broker thread. It:
//! - Recovers existing segments and the checkpoint on startup
//! - Spawns the broker and hands out [`Producer`] and [`Consumer`] handles
//! - Drains and stops the broker on shutdown or drop
//!
//! ## Usage
//!
//! ```ignore
//! let spool = SpoolBuilder::new("/var/lib/agent/spool").build()?;
//!
//! let producer = spool.producer()?;
//! producer.push(&b"hello"[..])?;
//!
//! let consumer = spool.consumer();
//! let batch = consumer.get(128)?;
//! ship(batch.events());
//! batch.ack()?;
//!
//! spool.shutdown()?;
//! ```

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use tracing::{info, warn};

use crate::{
    Result, SpoolConfig,
    broker::{Broker, SpoolStats},
    consumer::Consumer,
    error::InternalSnafu,
    producer::Producer,
    recovery::{RecoveryReport, recover},
    request::{Requests, ShutdownRequest, StatsRequest, call, channels},
};

/// A disk-backed event spool.
pub struct Spool {
    config:        Arc<SpoolConfig>,
    requests:      Requests,
    report:        RecoveryReport,
    broker_handle: Option<JoinHandle<()>>,
}

impl Spool {
    /// Recovers the spool under `config.base_path` and starts its broker.
    pub fn open(config: SpoolConfig) -> Result<Self> {
        let config = Arc::new(config);
        let recovered = recover(&config)?;
        let report = recovered.report.clone();

        let (requests, inbox) = channels();
        let broker = Broker::new(config.clone(), recovered);
        let broker_handle = thread::Builder::new()
            .name("spool-broker".into())
            .spawn(move || broker.run(inbox))?;

        info!(
            path = ?config.base_path,
            replayed = report.replayed,
            next_sequence = report.next_sequence,
            "Spool opened"
        );

        Ok(Self {
            config,
            requests,
            report,
            broker_handle: Some(broker_handle),
        })
    }

    /// Registers a new producer.
    pub fn producer(&self) -> Result<Producer> { Producer::open(self.requests.clone()) }

    #[must_use]
    pub fn consumer(&self) -> Consumer { Consumer::new(self.requests.clone()) }

    pub fn stats(&self) -> Result<SpoolStats> {
        call(&self.requests.stats, |resp| StatsRequest { resp })
    }

    /// What recovery found when the spool was opened.
    #[must_use]
    pub const fn recovery_report(&self) -> &RecoveryReport { &self.report }

    #[must_use]
    pub fn config(&self) -> &SpoolConfig { &self.config }

    /// Stops accepting events, drains for up to the configured timeout,
    /// persists the checkpoint and joins the broker thread.
    ///
    /// Handles that outlive the spool get [`Closed`](crate::SpoolError::Closed).
    pub fn shutdown(mut self) -> Result<()> { self.stop() }

    fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.broker_handle.take() else {
            return Ok(());
        };
        info!("Shutting down spool");

        let answer = call(&self.requests.shutdown, |resp| ShutdownRequest { resp });
        handle.join().map_err(|_| {
            InternalSnafu {
                message: "broker thread panicked".to_string(),
            }
            .build()
        })?;
        answer?;

        info!("Spool shutdown complete");
        Ok(())
    }
}

impl std::fmt::Debug for Spool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spool")
            .field("base_path", &self.config.base_path)
            .field("running", &self.broker_handle.is_some())
            .finish()
    }
}

impl Drop for Spool {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Spool did not shut down cleanly");
        }
    }
}
