// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod consent;
mod delivery;
mod report_store;

pub use consent::{
    clamp_sync_timeout, ConsentCoordinator, ConsentDecision, ConsentHandler, ConsentReply,
};
pub use delivery::{
    DeliveryCoordinator, DeliveryOutcome, DeliveryPass, DeliverySummary, OnReportSent, ReportSink,
};
pub use report_store::{
    CapturePaths, ClaimedReport, PendingReport, ReportStore, ReportStoreError, SessionMarker,
};
