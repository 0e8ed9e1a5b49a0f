//! RNG flow

use crate::error::{HsmError, HsmResult};
use crate::flow::FlowKind;
use crate::handle::Handle;
use crate::hsm::Hsm;

impl Hsm {
    /// `len` bytes from the enclave DRBG
    pub fn get_random(&self, flow: Handle, len: usize) -> HsmResult<Vec<u8>> {
        if len == 0 {
            return Err(HsmError::param("zero length random request"));
        }
        self.flow_access(flow, &[FlowKind::Rng])?;
        Ok(self.engine().random_bytes(len)?)
    }
}
