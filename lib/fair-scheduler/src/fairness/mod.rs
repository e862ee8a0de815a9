// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fairness accounting: the virtual counter ledger, the service cost model and
//! the policies that turn both into a selection order.

mod cost;
mod ledger;
mod policy;

pub use cost::{round_service, split_round, RoundTokens, ServiceCostFactors};
pub use ledger::VirtualCounterLedger;
pub use policy::{DampingTable, FairnessPolicy, FcfsPolicy, SelectionKey, ServedRound, VtcPolicy};
