// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod crash_type;
mod record;
mod test_utils;

pub use crash_type::*;
pub use record::*;
