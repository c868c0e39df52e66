// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::boot_script::BootScriptError;
use crate::descriptor::DescriptorError;
use crate::roles::ResolveError;
use crate::topology::AllocationError;

/// Failures of a planning run, by the stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    BootScript(#[from] BootScriptError),
}

pub type Result<T> = core::result::Result<T, Error>;
