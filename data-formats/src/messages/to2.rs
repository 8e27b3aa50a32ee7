use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_tuple::{Deserialize_tuple, Serialize_tuple};

use super::{ClientMessage, EncryptionRequirement, Message, ServerMessage};

use crate::{
    conformance::{TestId, TestMutable},
    constants::{CipherSuite, KexSuite, MessageType},
    cose::COSESign,
    publickey::PublicKey,
    rendezvous::RendezvousInfo,
    types::{Guid, HMac, Hash, Nonce, ServiceInfo, SigInfo},
};

pub const DEFAULT_MAX_MESSAGE_SIZE: u16 = 1300;

#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct HelloDevice {
    max_device_message_size: u16,
    guid: Guid,
    nonce5: Nonce,
    kex_suite: KexSuite,
    cipher_suite: CipherSuite,
    a_signature_info: SigInfo,
}

impl HelloDevice {
    pub fn new(
        guid: Guid,
        nonce5: Nonce,
        kex_suite: KexSuite,
        cipher_suite: CipherSuite,
        a_signature_info: SigInfo,
    ) -> Self {
        HelloDevice {
            max_device_message_size: DEFAULT_MAX_MESSAGE_SIZE,

            guid,
            nonce5,
            kex_suite,
            cipher_suite,
            a_signature_info,
        }
    }

    pub fn max_device_message_size(&self) -> u16 {
        self.max_device_message_size
    }

    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    /// NonceTO2ProveOV
    pub fn nonce5(&self) -> &Nonce {
        &self.nonce5
    }

    pub fn kex_suite(&self) -> KexSuite {
        self.kex_suite
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    pub fn a_signature_info(&self) -> &SigInfo {
        &self.a_signature_info
    }
}

impl Message for HelloDevice {
    fn message_type() -> MessageType {
        MessageType::TO2HelloDevice
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        message_type.is_none()
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustNotBeEncrypted)
    }
}

impl ClientMessage for HelloDevice {}

/// Signed by the current owner; the unprotected header carries
/// NonceTO2ProveDv and the owner public key.
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProveOVHdr(COSESign);

impl ProveOVHdr {
    pub fn new(token: COSESign) -> Self {
        ProveOVHdr(token)
    }

    pub fn token(&self) -> &COSESign {
        &self.0
    }

    pub fn into_token(self) -> COSESign {
        self.0
    }
}

impl Message for ProveOVHdr {
    fn message_type() -> MessageType {
        MessageType::TO2ProveOVHdr
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        matches!(message_type, Some(MessageType::TO2HelloDevice))
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustNotBeEncrypted)
    }
}

impl ServerMessage for ProveOVHdr {}

impl TestMutable for ProveOVHdr {
    fn mutate(mut self, test: TestId) -> Self {
        if test == TestId::Device60BadCoseSignature {
            self.0.corrupt_signature();
        }
        self
    }
}

#[derive(Debug, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct TO2ProveOVHdrPayload {
    ov_header: ByteBuf,
    num_ov_entries: u8,
    hmac: HMac,
    nonce5: Nonce,
    b_signature_info: SigInfo,
    a_key_exchange: ByteBuf,
    hello_device_hash: Hash,
    max_owner_message_size: u16,
}

impl TO2ProveOVHdrPayload {
    pub fn new(
        ov_header: Vec<u8>,
        num_ov_entries: u8,
        hmac: HMac,
        nonce5: Nonce,
        b_signature_info: SigInfo,
        a_key_exchange: Vec<u8>,
        hello_device_hash: Hash,
    ) -> Self {
        TO2ProveOVHdrPayload {
            ov_header: ByteBuf::from(ov_header),
            num_ov_entries,
            hmac,
            nonce5,
            b_signature_info,
            a_key_exchange: ByteBuf::from(a_key_exchange),
            hello_device_hash,
            max_owner_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// The raw header bytes, as covered by the header HMAC
    pub fn ov_header(&self) -> &[u8] {
        &self.ov_header
    }

    pub fn num_ov_entries(&self) -> u8 {
        self.num_ov_entries
    }

    pub fn hmac(&self) -> &HMac {
        &self.hmac
    }

    pub fn nonce5(&self) -> &Nonce {
        &self.nonce5
    }

    pub fn b_signature_info(&self) -> &SigInfo {
        &self.b_signature_info
    }

    pub fn a_key_exchange(&self) -> &[u8] {
        &self.a_key_exchange
    }

    pub fn hello_device_hash(&self) -> &Hash {
        &self.hello_device_hash
    }

    pub fn max_owner_message_size(&self) -> u16 {
        self.max_owner_message_size
    }
}

impl TestMutable for TO2ProveOVHdrPayload {
    fn mutate(mut self, test: TestId) -> Self {
        match test {
            TestId::Device60BadNonceTO2ProveOV => self.nonce5 = self.nonce5.corrupted(),
            TestId::Device60BadHelloDeviceHash => {
                self.hello_device_hash = self.hello_device_hash.corrupted()
            }
            _ => {}
        }
        self
    }
}

#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct GetOVNextEntry {
    entry_num: u8,
}

impl GetOVNextEntry {
    pub fn new(entry_num: u8) -> Self {
        GetOVNextEntry { entry_num }
    }

    pub fn entry_num(&self) -> u8 {
        self.entry_num
    }
}

impl Message for GetOVNextEntry {
    fn message_type() -> MessageType {
        MessageType::TO2GetOVNextEntry
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        matches!(
            message_type,
            Some(MessageType::TO2ProveOVHdr) | Some(MessageType::TO2OVNextEntry)
        )
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustNotBeEncrypted)
    }
}

impl ClientMessage for GetOVNextEntry {}

#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct OVNextEntry {
    entry_num: u8,
    entry: COSESign,
}

impl OVNextEntry {
    pub fn new(entry_num: u8, entry: COSESign) -> Self {
        OVNextEntry { entry_num, entry }
    }

    pub fn entry_num(&self) -> u8 {
        self.entry_num
    }

    pub fn entry(&self) -> &COSESign {
        &self.entry
    }
}

impl Message for OVNextEntry {
    fn message_type() -> MessageType {
        MessageType::TO2OVNextEntry
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        matches!(message_type, Some(MessageType::TO2GetOVNextEntry))
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustNotBeEncrypted)
    }
}

impl ServerMessage for OVNextEntry {}

impl TestMutable for OVNextEntry {
    fn mutate(mut self, test: TestId) -> Self {
        match test {
            TestId::Device62BadOVEntryNum => self.entry_num = self.entry_num.wrapping_add(1),
            TestId::Device62BadOVEntryCoseSignature => self.entry.corrupt_signature(),
            _ => {}
        }
        self
    }
}

/// EAT signed by the device key: the nonce is NonceTO2ProveDv, the FDO
/// claim is a [`TO2ProveDevicePayload`] and the unprotected header carries
/// NonceTO2SetupDv.
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProveDevice(COSESign);

impl ProveDevice {
    pub fn new(token: COSESign) -> Self {
        ProveDevice(token)
    }

    pub fn token(&self) -> &COSESign {
        &self.0
    }
}

impl Message for ProveDevice {
    fn message_type() -> MessageType {
        MessageType::TO2ProveDevice
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        matches!(message_type, Some(MessageType::TO2OVNextEntry))
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustNotBeEncrypted)
    }
}

impl ClientMessage for ProveDevice {}

#[derive(Debug, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct TO2ProveDevicePayload {
    b_key_exchange: ByteBuf,
}

impl TO2ProveDevicePayload {
    pub fn new(b_key_exchange: Vec<u8>) -> Self {
        TO2ProveDevicePayload {
            b_key_exchange: ByteBuf::from(b_key_exchange),
        }
    }

    pub fn b_key_exchange(&self) -> &[u8] {
        &self.b_key_exchange
    }
}

/// Signed by the replacement owner key carried inside the payload
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SetupDevice(COSESign);

impl SetupDevice {
    pub fn new(token: COSESign) -> Self {
        SetupDevice(token)
    }

    pub fn token(&self) -> &COSESign {
        &self.0
    }
}

impl Message for SetupDevice {
    fn message_type() -> MessageType {
        MessageType::TO2SetupDevice
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        matches!(message_type, Some(MessageType::TO2ProveDevice))
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustBeEncrypted)
    }
}

impl ServerMessage for SetupDevice {}

#[derive(Debug, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct TO2SetupDevicePayload {
    rendezvous_info: RendezvousInfo,
    guid: Guid,
    nonce7: Nonce,
    owner2_key: PublicKey,
}

impl TO2SetupDevicePayload {
    pub fn new(
        rendezvous_info: RendezvousInfo,
        guid: Guid,
        nonce7: Nonce,
        owner2_key: PublicKey,
    ) -> Self {
        TO2SetupDevicePayload {
            rendezvous_info,
            guid,
            nonce7,
            owner2_key,
        }
    }

    pub fn rendezvous_info(&self) -> &RendezvousInfo {
        &self.rendezvous_info
    }

    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    /// NonceTO2SetupDv
    pub fn nonce7(&self) -> &Nonce {
        &self.nonce7
    }

    pub fn owner2_key(&self) -> &PublicKey {
        &self.owner2_key
    }
}

impl TestMutable for TO2SetupDevicePayload {
    fn mutate(mut self, test: TestId) -> Self {
        if test == TestId::Device64BadNonceTO2SetupDv {
            self.nonce7 = self.nonce7.corrupted();
        }
        self
    }
}

#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct DeviceServiceInfoReady {
    replacement_hmac: Option<HMac>,
    max_owner_service_info_size: Option<u16>,
}

impl DeviceServiceInfoReady {
    pub fn new(replacement_hmac: Option<HMac>, max_owner_service_info_size: Option<u16>) -> Self {
        DeviceServiceInfoReady {
            replacement_hmac,
            max_owner_service_info_size,
        }
    }

    /// Absent when the device keeps its credential
    pub fn replacement_hmac(&self) -> Option<&HMac> {
        self.replacement_hmac.as_ref()
    }

    pub fn max_owner_service_info_size(&self) -> Option<u16> {
        self.max_owner_service_info_size
    }
}

impl Message for DeviceServiceInfoReady {
    fn message_type() -> MessageType {
        MessageType::TO2DeviceServiceInfoReady
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        matches!(message_type, Some(MessageType::TO2SetupDevice))
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustBeEncrypted)
    }
}

impl ClientMessage for DeviceServiceInfoReady {}

#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct OwnerServiceInfoReady {
    max_device_service_info_size: Option<u16>,
}

impl OwnerServiceInfoReady {
    pub fn new(max_device_service_info_size: Option<u16>) -> Self {
        OwnerServiceInfoReady {
            max_device_service_info_size,
        }
    }

    pub fn max_device_service_info_size(&self) -> Option<u16> {
        self.max_device_service_info_size
    }
}

impl Message for OwnerServiceInfoReady {
    fn message_type() -> MessageType {
        MessageType::TO2OwnerServiceInfoReady
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        matches!(message_type, Some(MessageType::TO2DeviceServiceInfoReady))
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustBeEncrypted)
    }
}

impl ServerMessage for OwnerServiceInfoReady {}

#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct DeviceServiceInfo {
    is_more_service_info: bool,
    service_info: ServiceInfo,
}

impl DeviceServiceInfo {
    pub fn new(is_more_service_info: bool, service_info: ServiceInfo) -> Self {
        DeviceServiceInfo {
            is_more_service_info,
            service_info,
        }
    }

    pub fn is_more_service_info(&self) -> bool {
        self.is_more_service_info
    }

    pub fn service_info(&self) -> &ServiceInfo {
        &self.service_info
    }
}

impl Message for DeviceServiceInfo {
    fn message_type() -> MessageType {
        MessageType::TO2DeviceServiceInfo
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        matches!(
            message_type,
            Some(MessageType::TO2OwnerServiceInfoReady) | Some(MessageType::TO2OwnerServiceInfo)
        )
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustBeEncrypted)
    }
}

impl ClientMessage for DeviceServiceInfo {}

#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct OwnerServiceInfo {
    is_more_service_info: bool,
    is_done: bool,
    service_info: ServiceInfo,
}

impl OwnerServiceInfo {
    pub fn new(is_more_service_info: bool, is_done: bool, service_info: ServiceInfo) -> Self {
        OwnerServiceInfo {
            is_more_service_info,
            is_done,
            service_info,
        }
    }

    pub fn is_more_service_info(&self) -> bool {
        self.is_more_service_info
    }

    pub fn is_done(&self) -> bool {
        self.is_done
    }

    pub fn service_info(&self) -> &ServiceInfo {
        &self.service_info
    }
}

impl Message for OwnerServiceInfo {
    fn message_type() -> MessageType {
        MessageType::TO2OwnerServiceInfo
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        matches!(message_type, Some(MessageType::TO2DeviceServiceInfo))
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustBeEncrypted)
    }
}

impl ServerMessage for OwnerServiceInfo {}

#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct Done {
    nonce6: Nonce,
}

impl Done {
    pub fn new(nonce6: Nonce) -> Self {
        Done { nonce6 }
    }

    /// NonceTO2ProveDv
    pub fn nonce6(&self) -> &Nonce {
        &self.nonce6
    }
}

impl Message for Done {
    fn message_type() -> MessageType {
        MessageType::TO2Done
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        matches!(message_type, Some(MessageType::TO2OwnerServiceInfo))
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustBeEncrypted)
    }
}

impl ClientMessage for Done {}

#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct Done2 {
    nonce7: Nonce,
}

impl Done2 {
    pub fn new(nonce7: Nonce) -> Self {
        Done2 { nonce7 }
    }

    /// NonceTO2SetupDv
    pub fn nonce7(&self) -> &Nonce {
        &self.nonce7
    }
}

impl Message for Done2 {
    fn message_type() -> MessageType {
        MessageType::TO2Done2
    }

    fn is_valid_previous_message(message_type: Option<MessageType>) -> bool {
        matches!(message_type, Some(MessageType::TO2Done))
    }

    fn encryption_requirement() -> Option<EncryptionRequirement> {
        Some(EncryptionRequirement::MustBeEncrypted)
    }
}

impl ServerMessage for Done2 {}

impl TestMutable for Done2 {
    fn mutate(mut self, test: TestId) -> Self {
        if test == TestId::Device70BadNonceTO2SetupDv64 {
            self.nonce7 = self.nonce7.corrupted();
        }
        self
    }
}

#[cfg(test)]
mod test {
    use super::{Done2, GetOVNextEntry, OVNextEntry};
    use crate::{
        conformance::{apply_test_mutation, TestId},
        cose::COSESign,
        types::Nonce,
        Serializable,
    };

    #[test]
    fn test_done2_mutation() {
        let nonce = Nonce::new().unwrap();
        let done2 = apply_test_mutation(Done2::new(nonce.clone()), None);
        done2.nonce7().compare(&nonce).unwrap();

        let done2 = apply_test_mutation(
            Done2::new(nonce.clone()),
            Some(TestId::Device70BadNonceTO2SetupDv64),
        );
        assert!(done2.nonce7().compare(&nonce).is_err());

        // Tests for other messages leave it alone
        let done2 = apply_test_mutation(
            Done2::new(nonce.clone()),
            Some(TestId::Device62BadOVEntryNum),
        );
        done2.nonce7().compare(&nonce).unwrap();
    }

    #[test]
    fn test_entry_num_mutation() {
        let entry = OVNextEntry::new(2, COSESign::default());
        let entry = apply_test_mutation(entry, Some(TestId::Device62BadOVEntryNum));
        assert_eq!(entry.entry_num(), 3);
    }

    #[test]
    fn test_get_entry_encoding() {
        let encoded = GetOVNextEntry::new(3).serialize_data().unwrap();
        assert_eq!(encoded, vec![0x81, 0x03]);
    }
}
