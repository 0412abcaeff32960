// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod async_file;
mod crash_handler;
mod emitters;
mod handler_registry;
mod report_writer;

pub use async_file::{AsyncFile, AsyncFileError, ASYNC_FILE_BUFFER_LEN};
pub use crash_handler::{
    capture_attempted, disable, enable, is_enabled, update_capture_context,
    update_termination_flag_path, CaptureContext,
};
pub use emitters::{OnCrashCallback, ReportFields, SignalDetails};
pub use handler_registry::{
    CrashReporterState, FunctionInfo, HandlerDescriptor, HandlerInfo, HandlerRegistry,
    HandlerRegistryError,
};
pub use report_writer::{CrashReportWriter, ReportWriter, MAX_CONTAINER_DEPTH};

pub(crate) use emitters::emit_report_file;
