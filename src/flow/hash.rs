//! Hash flow

use crate::algo::HashAlgo;
use crate::error::HsmResult;
use crate::flow::FlowKind;
use crate::handle::Handle;
use crate::hsm::Hsm;

impl Hsm {
    pub fn hash_one_go(&self, flow: Handle, algo: HashAlgo, input: &[u8]) -> HsmResult<Vec<u8>> {
        self.config().capabilities.require_hash(algo)?;
        let access = self.flow_access(flow, &[FlowKind::Hash])?;
        self.config()
            .require_fips_allowed(access.mode, algo.is_fips_approved(), "SM3")?;
        Ok(self.engine().hash(algo, input)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HsmError;
    use crate::flags::SessionMode;
    use crate::hsm::testing::hsm;
    use crate::session::SessionConfig;

    #[test]
    fn test_digest_sizes_and_fips() {
        let (hsm, _) = hsm();
        let session = hsm.open_session(SessionConfig::default()).unwrap();
        let flow = hsm.open_service(session, FlowKind::Hash).unwrap();
        for algo in HashAlgo::ALL {
            assert_eq!(hsm.hash_one_go(flow, *algo, b"abc").unwrap().len(), algo.digest_size());
        }
        assert_eq!(
            hex::encode(hsm.hash_one_go(flow, HashAlgo::Sha256, b"abc").unwrap()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        let fips = hsm
            .open_session(SessionConfig::new(Default::default(), SessionMode::FIPS_ONLY))
            .unwrap();
        let flow = hsm.open_service(fips, FlowKind::Hash).unwrap();
        assert!(matches!(
            hsm.hash_one_go(flow, HashAlgo::Sm3_256, b"abc"),
            Err(HsmError::FeatureDisabled(_))
        ));
    }
}
