// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Returns early unless the condition holds
///
/// The second form evaluates to the provided expression, which may itself be
/// a control-flow expression (`continue`, `break`).
macro_rules! ensure {
    ($cond:expr $(,)?) => {
        ensure!($cond, ())
    };
    ($cond:expr, $otherwise:expr $(,)?) => {
        if !($cond) {
            return $otherwise;
        }
    };
}
