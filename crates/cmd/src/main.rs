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

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use clap::{Args, Parser, Subcommand};
use logspool_common_telemetry::{LoggingOptions, init_global_logging, set_panic_hook};
use snafu::{ResultExt, Whatever, whatever};
use spool::{CheckpointPolicy, FlushMode, SpoolBuilder, inspect};
use tracing::info;

#[derive(Debug, Parser)]
#[clap(
name = "logspool",
about = "logspool-cmd",
author = env!("CARGO_PKG_AUTHORS"),
version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Log filter, e.g. `info` or `info,spool=debug`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Inspect(InspectArgs),
    Stress(StressArgs),
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Print the checkpoint and every segment of a spool directory.
Nothing on disk is modified.
Examples:

logspool inspect ./spool_data

")]
struct InspectArgs {
    dir: PathBuf,
}

impl InspectArgs {
    fn run(&self) -> Result<(), Whatever> {
        let inspection = inspect(&self.dir)
            .with_whatever_context(|_| format!("failed to inspect {}", self.dir.display()))?;

        match &inspection.checkpoint {
            Ok(Some(cp)) => println!(
                "checkpoint: version={} read={} write={} next_sequence={}",
                cp.version, cp.read, cp.write, cp.next_sequence
            ),
            Ok(None) => println!("checkpoint: none"),
            Err(reason) => println!("checkpoint: unreadable ({reason})"),
        }

        println!("{:>20} {:>12} {:>8}  {:<24} status", "segment", "bytes", "frames", "sequences");
        for segment in &inspection.segments {
            let range = match (segment.first_sequence, segment.last_sequence) {
                (Some(first), Some(last)) => format!("{first}..={last}"),
                _ => "-".to_string(),
            };
            let status = segment.damage.as_deref().unwrap_or("ok");
            println!(
                "{:>20} {:>12} {:>8}  {:<24} {}",
                segment.id, segment.size, segment.frames, range, status
            );
        }
        println!("unacknowledged frames: {}", inspection.unacknowledged());
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Run producer threads and one consumer against a spool and report throughput.
Ctrl-C stops the producers and drains what was pushed.
Examples:

logspool stress --dir /tmp/spool --producers 4 --events 100000 --batch 512

")]
struct StressArgs {
    #[arg(long)]
    dir:        PathBuf,
    #[arg(long, default_value_t = 4)]
    producers:  usize,
    /// Events pushed by each producer.
    #[arg(long, default_value_t = 100_000)]
    events:     u64,
    /// Maximum events per get.
    #[arg(long, default_value_t = 512)]
    batch:      usize,
    #[arg(long, default_value_t = 256)]
    event_size: usize,
    /// fsync every push instead of leaving it to the OS.
    #[arg(long)]
    sync:       bool,
}

impl StressArgs {
    fn run(&self) -> Result<(), Whatever> {
        let stop = Arc::new(AtomicBool::new(false));
        {
            let stop = stop.clone();
            ctrlc::set_handler(move || {
                info!("Interrupted, stopping producers");
                stop.store(true, Ordering::SeqCst);
            })
            .whatever_context("failed to install Ctrl-C handler")?;
        }

        let flush_mode = if self.sync {
            FlushMode::Sync
        } else {
            FlushMode::Async
        };
        let spool = SpoolBuilder::new(&self.dir)
            .flush_mode(flush_mode)
            .checkpoint_policy(CheckpointPolicy::Interval(Duration::from_millis(200)))
            .build()
            .with_whatever_context(|_| format!("failed to open spool at {}", self.dir.display()))?;
        let replayed = spool.recovery_report().replayed as u64;

        let pushed = Arc::new(AtomicU64::new(0));
        let started = Instant::now();
        let mut producers = Vec::with_capacity(self.producers);
        for _ in 0..self.producers {
            let producer = spool.producer().whatever_context("failed to open producer")?;
            let stop = stop.clone();
            let pushed = pushed.clone();
            let events = self.events;
            let payload = vec![b'x'; self.event_size];
            producers.push(thread::spawn(move || {
                for _ in 0..events {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if producer.push(payload.clone())?.is_some() {
                        pushed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok::<_, spool::SpoolError>(())
            }));
        }

        let consumer = spool.consumer();
        let mut received = 0u64;
        loop {
            let producers_done = producers.iter().all(thread::JoinHandle::is_finished);
            let expected = replayed + pushed.load(Ordering::Relaxed);
            if producers_done && received >= expected {
                break;
            }
            if let Some(batch) = consumer
                .get_timeout(self.batch, Duration::from_millis(100))
                .whatever_context("get failed")?
            {
                received += batch.len() as u64;
                batch.ack().whatever_context("ack failed")?;
            }
        }

        for handle in producers {
            match handle.join() {
                Ok(result) => result.whatever_context("push failed")?,
                Err(_) => whatever!("producer thread panicked"),
            }
        }

        let elapsed = started.elapsed();
        let stats = spool.stats().whatever_context("stats failed")?;
        spool.shutdown().whatever_context("shutdown failed")?;

        let rate = received as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        println!(
            "received {received} events ({replayed} replayed) in {:.2?}: {rate:.0} events/s",
            elapsed
        );
        println!(
            "next_sequence={} durable_read={} sealed_segments={}",
            stats.next_sequence, stats.durable_read, stats.sealed_segments
        );
        Ok(())
    }
}

fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    let opts = LoggingOptions {
        level: cli.log_level.clone(),
        ..Default::default()
    };
    let _guards = init_global_logging("logspool", &opts);
    set_panic_hook();

    match cli.commands {
        Commands::Inspect(args) => args.run(),
        Commands::Stress(args) => args.run(),
    }
}
