// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[cfg(any(feature = "metrics", test))]
pub(crate) const OUTCOME_NAME: &str = "stampede.outcome";

#[cfg(test)]
pub(crate) const KEY_NAME: &str = "stampede.key";

#[cfg(test)]
pub(crate) const RETRIES_NAME: &str = "stampede.retries";

#[cfg(test)]
pub(crate) const LATENCY_NAME: &str = "stampede.latency_ms";

#[cfg(test)]
pub(crate) const FETCH_EVENT_NAME: &str = "stampede.fetch";
