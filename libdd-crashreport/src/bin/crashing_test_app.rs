// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Starts crash reporting on the store given as first argument, then ends the way the second
//! argument says.  Driven by the integration tests.

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    unix::main()
}

#[cfg(unix)]
mod unix {
    use anyhow::Context;
    use async_trait::async_trait;
    use libdd_crashreport::collector::CrashReportWriter;
    use libdd_crashreport::receiver::ReportSink;
    use libdd_crashreport::{
        CrashMetaRecord, CrashReporting, CrashReportingConfiguration, MetadataProvider,
    };
    use std::env;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    /// Keeps a copy of every delivered report under `<store>/sent`.
    struct DirectorySink {
        dir: PathBuf,
    }

    #[async_trait]
    impl ReportSink for DirectorySink {
        async fn send(&self, record: &CrashMetaRecord, _: &Path) -> anyhow::Result<()> {
            std::fs::create_dir_all(&self.dir)?;
            let path = self.dir.join(format!("{}.json", record.occurrence_id));
            std::fs::write(path, serde_json::to_vec_pretty(record)?)?;
            Ok(())
        }
    }

    struct AppMetadata;

    impl MetadataProvider for AppMetadata {
        fn user_attributes(&self) -> Vec<(String, String)> {
            vec![
                ("service".to_string(), "crashing_test_app".to_string()),
                ("user_id".to_string(), "1234".to_string()),
            ]
        }
    }

    fn on_crash(writer: &mut dyn CrashReportWriter) {
        writer.add_string("component", "crashing_test_app");
        writer.begin_array("queue_depths");
        writer.add_unsigned_integer("", 3);
        writer.add_unsigned_integer("", 7);
        writer.end_container();
    }

    #[inline(never)]
    unsafe fn deref_ptr(p: *mut u8) {
        *std::hint::black_box(p) = std::hint::black_box(1);
    }

    pub fn main() -> anyhow::Result<()> {
        let mut args = env::args().skip(1);
        let store_dir = PathBuf::from(args.next().context("Unexpected number of arguments")?);
        let mode = args.next().context("Unexpected number of arguments")?;

        let sink = Arc::new(DirectorySink {
            dir: store_dir.join("sent"),
        });
        let config = CrashReportingConfiguration::default();
        let reporting = CrashReporting::new(config, store_dir.join("reports"), sink)?;
        reporting.set_metadata_provider(Some(Arc::new(AppMetadata)));
        reporting.set_on_crash_callback(Some(on_crash))?;
        let pass = reporting.start()?;
        reporting.refresh_user_attributes()?;
        let summary = pass.wait();
        println!("did_last_session_crash={}", reporting.did_last_session_crash());
        println!("sent={}", summary.sent);

        match mode.as_str() {
            "segv" => unsafe { deref_ptr(std::ptr::null_mut::<u8>()) },
            "abort" => std::process::abort(),
            "abort_after_launch" => {
                reporting.mark_launch_crash_free();
                std::process::abort()
            }
            "panic" => panic!("the answer was not 42"),
            "panic_then_abort" => {
                let worker = std::thread::spawn(|| panic!("the answer was not 42"));
                anyhow::ensure!(worker.join().is_err(), "Worker thread did not panic");
                std::process::abort()
            }
            "return_without_shutdown" => return Ok(()),
            // Nothing runs after SIGKILL, as when the system reclaims memory.
            "killed" => unsafe {
                libc::kill(libc::getpid(), libc::SIGKILL);
            },
            "terminated" => unsafe {
                libc::raise(libc::SIGTERM);
            },
            "clean" => {
                let state = reporting.crash_reporter_state();
                anyhow::ensure!(state.is_active, "Crash handlers not active: {state:?}");
                reporting.shutdown()?;
            }
            other => anyhow::bail!("Unknown mode {other}"),
        }
        Ok(())
    }
}
