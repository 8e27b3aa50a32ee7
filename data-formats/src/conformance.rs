//! Hooks used by conformance test runs to corrupt listener responses.
//!
//! Handlers build their response normally and then pass it through
//! [`apply_test_mutation`] with whatever test the installed
//! [`ConformanceHook`] reports as active for the device.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{constants::MessageType, types::Guid, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestId {
    /// RVRedirect carries a To1d blob with a broken signature
    Device32BadTo1d,
    /// ProveOVHdr echoes the wrong NonceTO2ProveOV
    Device60BadNonceTO2ProveOV,
    /// ProveOVHdr carries a wrong hash of HelloDevice
    Device60BadHelloDeviceHash,
    /// ProveOVHdr has a broken signature
    Device60BadCoseSignature,
    /// OVNextEntry answers with a different entry number
    Device62BadOVEntryNum,
    /// OVNextEntry carries an entry with a broken signature
    Device62BadOVEntryCoseSignature,
    /// SetupDevice echoes the wrong NonceTO2SetupDv
    Device64BadNonceTO2SetupDv,
    /// Done2 echoes the wrong NonceTO2SetupDv
    Device70BadNonceTO2SetupDv64,
}

impl TestId {
    pub fn name(&self) -> &'static str {
        match self {
            TestId::Device32BadTo1d => "device-32-bad-to1d",
            TestId::Device60BadNonceTO2ProveOV => "device-60-bad-nonce-to2proveov",
            TestId::Device60BadHelloDeviceHash => "device-60-bad-hellodevice-hash",
            TestId::Device60BadCoseSignature => "device-60-bad-cose-signature",
            TestId::Device62BadOVEntryNum => "device-62-bad-oventrynum",
            TestId::Device62BadOVEntryCoseSignature => "device-62-bad-oventry-cose-signature",
            TestId::Device64BadNonceTO2SetupDv => "device-64-bad-nonce-to2setupdv",
            TestId::Device70BadNonceTO2SetupDv64 => "device-70-bad-nonce-to2setupdv64",
        }
    }

    /// The response message this test corrupts
    pub fn message_type(&self) -> MessageType {
        match self {
            TestId::Device32BadTo1d => MessageType::TO1RVRedirect,
            TestId::Device60BadNonceTO2ProveOV
            | TestId::Device60BadHelloDeviceHash
            | TestId::Device60BadCoseSignature => MessageType::TO2ProveOVHdr,
            TestId::Device62BadOVEntryNum | TestId::Device62BadOVEntryCoseSignature => {
                MessageType::TO2OVNextEntry
            }
            TestId::Device64BadNonceTO2SetupDv => MessageType::TO2SetupDevice,
            TestId::Device70BadNonceTO2SetupDv64 => MessageType::TO2Done2,
        }
    }
}

const ALL_TESTS: &[TestId] = &[
    TestId::Device32BadTo1d,
    TestId::Device60BadNonceTO2ProveOV,
    TestId::Device60BadHelloDeviceHash,
    TestId::Device60BadCoseSignature,
    TestId::Device62BadOVEntryNum,
    TestId::Device62BadOVEntryCoseSignature,
    TestId::Device64BadNonceTO2SetupDv,
    TestId::Device70BadNonceTO2SetupDv64,
];

impl FromStr for TestId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        ALL_TESTS
            .iter()
            .find(|test| test.name() == s)
            .copied()
            .ok_or(Error::InconsistentValue("conformance test id"))
    }
}

/// Tells listeners which conformance test, if any, is running for a device
pub trait ConformanceHook: Send + Sync + std::fmt::Debug {
    /// The active test for `guid` when about to emit `response`
    fn active_test(&self, guid: &Guid, response: MessageType) -> Option<TestId>;

    /// Called for every GetOVNextEntry a device sends
    fn record_entry_request(&self, _guid: &Guid, _entry_num: u8) {}
}

/// The hook installed outside of conformance runs
#[derive(Debug, Default, Clone, Copy)]
pub struct NoConformanceTests;

impl ConformanceHook for NoConformanceTests {
    fn active_test(&self, _guid: &Guid, _response: MessageType) -> Option<TestId> {
        None
    }
}

/// A hook running one fixed test against every device
#[derive(Debug, Clone, Copy)]
pub struct FixedConformanceTest(pub TestId);

impl ConformanceHook for FixedConformanceTest {
    fn active_test(&self, _guid: &Guid, response: MessageType) -> Option<TestId> {
        if self.0.message_type() == response {
            Some(self.0)
        } else {
            None
        }
    }
}

/// A value a conformance test can corrupt after it has been built
pub trait TestMutable: Sized {
    fn mutate(self, test: TestId) -> Self;
}

pub fn apply_test_mutation<T: TestMutable>(value: T, test: Option<TestId>) -> T {
    match test {
        None => value,
        Some(test) => {
            log::warn!("Applying conformance test mutation {}", test.name());
            value.mutate(test)
        }
    }
}

#[cfg(test)]
mod test {
    use super::{ConformanceHook, FixedConformanceTest, NoConformanceTests, TestId};
    use crate::{constants::MessageType, types::Guid};

    #[test]
    fn test_names_round_trip() {
        for test in super::ALL_TESTS {
            assert_eq!(test.name().parse::<TestId>().unwrap(), *test);
        }
        assert!("device-99-bogus".parse::<TestId>().is_err());
    }

    #[test]
    fn test_hooks() {
        let guid = Guid::new().unwrap();
        assert_eq!(
            NoConformanceTests.active_test(&guid, MessageType::TO2ProveOVHdr),
            None
        );
        let hook = FixedConformanceTest(TestId::Device62BadOVEntryNum);
        assert_eq!(
            hook.active_test(&guid, MessageType::TO2OVNextEntry),
            Some(TestId::Device62BadOVEntryNum)
        );
        assert_eq!(hook.active_test(&guid, MessageType::TO2ProveOVHdr), None);
    }
}
