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

//! Panic hook that reports panics through `tracing`.
//!
//! A panic on the broker thread otherwise only reaches stderr; routing it
//! through the subscriber puts it next to the spool's own log lines.

use std::{
    panic,
    sync::atomic::{AtomicU64, Ordering},
};

use backtrace::Backtrace;

static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

/// Panics observed since [`set_panic_hook`] was installed.
pub fn panic_count() -> u64 { PANIC_COUNT.load(Ordering::Relaxed) }

/// Logs every panic as an `error!` event with its location, thread and
/// backtrace, then defers to the previously installed hook.
pub fn set_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic| {
        let backtrace = format!("{:?}", Backtrace::new());
        let thread = std::thread::current();
        let thread = thread.name().unwrap_or("<unnamed>");
        if let Some(location) = panic.location() {
            tracing::error!(
                message = %panic,
                backtrace = %backtrace,
                thread,
                panic.file = location.file(),
                panic.line = location.line(),
                panic.column = location.column(),
            );
        } else {
            tracing::error!(message = %panic, backtrace = %backtrace, thread);
        }
        PANIC_COUNT.fetch_add(1, Ordering::Relaxed);
        default_hook(panic);
    }));
}
