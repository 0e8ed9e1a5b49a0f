//! Data storage flow: opaque blobs kept next to the owning key store

use crate::error::HsmResult;
use crate::flow::FlowKind;
use crate::handle::Handle;
use crate::hsm::Hsm;
use log::debug;

const DATA_STORAGE: &[FlowKind] = &[FlowKind::DataStorage];

impl Hsm {
    /// Write `data` under `data_id`, replacing any previous blob
    pub fn store_data(&self, flow: Handle, data_id: u16, data: &[u8]) -> HsmResult<()> {
        self.store_op(flow, DATA_STORAGE, |_, store| {
            store.store_data(data_id, data)?;
            debug!("Stored {} bytes as data {:#x} in key store {}", data.len(), data_id, store.id());
            Ok(())
        })
    }

    pub fn retrieve_data(&self, flow: Handle, data_id: u16) -> HsmResult<Vec<u8>> {
        self.store_op(flow, DATA_STORAGE, |_, store| store.retrieve_data(data_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CapabilityTable, Feature, HsmConfig};
    use crate::error::HsmError;
    use crate::hsm::testing::*;

    #[test]
    fn test_store_and_retrieve_across_attach() {
        let (hsm, _) = hsm();
        let (session, ks) = key_store(&hsm, 7, 42, 10);
        let flow = hsm.open_service(ks, FlowKind::DataStorage).unwrap();
        hsm.store_data(flow, 0x10, b"calibration").unwrap();
        assert_eq!(hsm.retrieve_data(flow, 0x10).unwrap(), b"calibration");
        assert_eq!(hsm.retrieve_data(flow, 0x11), Err(HsmError::UnknownId(0x11)));
        assert!(matches!(hsm.store_data(flow, 0x12, b""), Err(HsmError::InvalidParam(_))));
        hsm.close_session(session).unwrap();

        let (_, ks) = attach(&hsm, 7, 42);
        let flow = hsm.open_service(ks, FlowKind::DataStorage).unwrap();
        assert_eq!(hsm.retrieve_data(flow, 0x10).unwrap(), b"calibration");
    }

    #[test]
    fn test_flow_requires_feature() {
        let mut caps = CapabilityTable::full();
        caps.features.remove(&Feature::DataStorage);
        let (hsm, _) = hsm_with(HsmConfig::with_capabilities(caps));
        let (_, ks) = key_store(&hsm, 7, 42, 10);
        assert!(matches!(
            hsm.open_service(ks, FlowKind::DataStorage),
            Err(HsmError::FeatureNotSupported(_))
        ));
    }
}
