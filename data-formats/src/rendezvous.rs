use std::collections::HashSet;
use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::{
    constants::{RendezvousProtocolValue, RendezvousVariable},
    errors::{Error, Result},
    from_cbor,
    to_cbor,
    types::{ip_from_bytes, ip_to_bytes, Hash, IPAddress},
};

/// One `[variable, value]` pair; the value is carried CBOR-encoded
#[derive(Clone, PartialEq)]
pub struct RendezvousInstruction {
    variable: RendezvousVariable,
    value: Option<Vec<u8>>,
}

impl fmt::Debug for RendezvousInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {})",
            self.variable.name(),
            self.value
                .as_ref()
                .map(hex::encode)
                .unwrap_or_else(|| "-".to_string())
        )
    }
}

impl Serialize for RendezvousInstruction {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // Markers without a value still carry one, as CBOR `true`
        let value = match &self.value {
            Some(v) => ByteBuf::from(v.clone()),
            None => ByteBuf::from(vec![0xf5]),
        };
        (self.variable, value).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RendezvousInstruction {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct InstructionVisitor;

        impl<'de> serde::de::Visitor<'de> for InstructionVisitor {
            type Value = RendezvousInstruction;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a rendezvous instruction [variable, value?]")
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let variable: RendezvousVariable = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;
                let value: Option<ByteBuf> = seq.next_element()?;
                Ok(RendezvousInstruction {
                    variable,
                    value: value.map(ByteBuf::into_vec),
                })
            }
        }

        deserializer.deserialize_seq(InstructionVisitor)
    }
}

impl RendezvousInstruction {
    pub fn new<T: Serialize>(variable: RendezvousVariable, value: &T) -> Result<Self> {
        Ok(RendezvousInstruction {
            variable,
            value: Some(to_cbor(value)?),
        })
    }

    pub fn new_marker(variable: RendezvousVariable) -> Self {
        RendezvousInstruction {
            variable,
            value: None,
        }
    }

    pub fn new_ip(variable: RendezvousVariable, ip: &IPAddress) -> Result<Self> {
        RendezvousInstruction::new(variable, &ByteBuf::from(ip_to_bytes(ip)))
    }

    pub fn variable(&self) -> RendezvousVariable {
        self.variable
    }

    pub fn value<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.value {
            Some(value) => from_cbor(value),
            None => Err(Error::InconsistentValue("rendezvous value missing")),
        }
    }

    fn ip_value(&self) -> Result<IPAddress> {
        let raw: ByteBuf = self.value()?;
        ip_from_bytes(&raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RendezvousDirective(Vec<RendezvousInstruction>);

impl RendezvousDirective {
    pub fn new(instructions: Vec<RendezvousInstruction>) -> Self {
        RendezvousDirective(instructions)
    }

    /// A directive pointing both device and owner at `host:port`
    pub fn for_host(host: &str, port: u16, protocol: RendezvousProtocolValue) -> Result<Self> {
        let mut instructions = Vec::new();
        match host.trim_start_matches('[').trim_end_matches(']').parse::<IPAddress>() {
            Ok(ip) => {
                instructions.push(RendezvousInstruction::new_ip(RendezvousVariable::IPAddress, &ip)?)
            }
            Err(_) => {
                instructions.push(RendezvousInstruction::new(RendezvousVariable::Dns, &host)?)
            }
        }
        instructions.push(RendezvousInstruction::new(
            RendezvousVariable::DevicePort,
            &port,
        )?);
        instructions.push(RendezvousInstruction::new(
            RendezvousVariable::OwnerPort,
            &port,
        )?);
        instructions.push(RendezvousInstruction::new(
            RendezvousVariable::Protocol,
            &(protocol as u8),
        )?);
        Ok(RendezvousDirective(instructions))
    }

    pub fn instructions(&self) -> &[RendezvousInstruction] {
        &self.0
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut has_address = false;
        for instruction in &self.0 {
            let variable = instruction.variable;
            if variable != RendezvousVariable::IPAddress && !seen.insert(variable as u8) {
                return Err(Error::InconsistentValue("duplicate rendezvous variable"));
            }
            if matches!(
                variable,
                RendezvousVariable::IPAddress | RendezvousVariable::Dns
            ) {
                has_address = true;
            }
        }
        if !has_address {
            return Err(Error::InconsistentValue("rendezvous directive without address"));
        }
        if seen.contains(&(RendezvousVariable::DeviceOnly as u8))
            && seen.contains(&(RendezvousVariable::OwnerOnly as u8))
        {
            return Err(Error::InconsistentValue("rendezvous directive for nobody"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RendezvousInfo(Vec<RendezvousDirective>);

impl RendezvousInfo {
    pub fn new(directives: Vec<RendezvousDirective>) -> Result<RendezvousInfo> {
        let info = RendezvousInfo(directives);
        info.validate()?;
        Ok(info)
    }

    pub fn values(&self) -> &[RendezvousDirective] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        self.0.iter().try_for_each(RendezvousDirective::validate)
    }

    pub fn to_interpreted(
        &self,
        side: RendezvousInterpreterSide,
    ) -> Result<Vec<RendezvousInterpretedDirective>> {
        let mut interpreted = Vec::new();
        for directive in &self.0 {
            if let Some(directive) = RendezvousInterpretedDirective::from_directive(directive, side)? {
                interpreted.push(directive);
            }
        }
        Ok(interpreted)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RendezvousInterpreterSide {
    Device,
    Owner,
}

#[derive(Debug, Clone)]
pub struct RendezvousInterpretedDirective {
    ip_addresses: Vec<IPAddress>,
    dns_name: Option<String>,
    port: u16,

    server_certificate_hash: Option<Hash>,
    ca_certificate_hash: Option<Hash>,

    user_input: bool,

    wifi_ssid: Option<String>,
    wifi_password: Option<String>,

    medium: Option<u8>,
    protocol: RendezvousProtocolValue,

    delay: u32,

    bypass: bool,
}

impl RendezvousInterpretedDirective {
    pub fn get_urls(&self) -> Vec<String> {
        let protocol_text = match self.protocol {
            RendezvousProtocolValue::Http => "http",
            RendezvousProtocolValue::Https => "https",
            _ => return Vec::new(),
        };

        let mut urls = Vec::new();

        if let Some(dns_name) = &self.dns_name {
            urls.push(format!("{}://{}:{}", protocol_text, dns_name, self.port));
        }

        for ip_address in &self.ip_addresses {
            match ip_address {
                IPAddress::V4(v4) => {
                    urls.push(format!("{}://{}:{}", protocol_text, v4, self.port))
                }
                IPAddress::V6(v6) => {
                    urls.push(format!("{}://[{}]:{}", protocol_text, v6, self.port))
                }
            }
        }

        urls
    }

    pub fn delay(&self) -> u32 {
        self.delay
    }

    pub fn bypass(&self) -> bool {
        self.bypass
    }

    pub fn user_input(&self) -> bool {
        self.user_input
    }

    pub fn medium(&self) -> Option<u8> {
        self.medium
    }

    pub fn wifi(&self) -> Option<(&str, Option<&str>)> {
        self.wifi_ssid
            .as_deref()
            .map(|ssid| (ssid, self.wifi_password.as_deref()))
    }

    pub fn server_certificate_hash(&self) -> Option<&Hash> {
        self.server_certificate_hash.as_ref()
    }

    pub fn ca_certificate_hash(&self) -> Option<&Hash> {
        self.ca_certificate_hash.as_ref()
    }

    fn from_directive(
        directive: &RendezvousDirective,
        side: RendezvousInterpreterSide,
    ) -> Result<Option<Self>> {
        let mut ip_addresses = Vec::new();
        let mut dns_name = None;
        let mut port = None;
        let mut server_certificate_hash = None;
        let mut ca_certificate_hash = None;
        let mut user_input = false;
        let mut wifi_ssid = None;
        let mut wifi_password = None;
        let mut medium = None;
        let mut protocol = RendezvousProtocolValue::Tls;
        let mut delay = 0;
        let mut bypass = false;

        let device = side == RendezvousInterpreterSide::Device;

        for instruction in directive.instructions() {
            match instruction.variable() {
                RendezvousVariable::DeviceOnly => {
                    if !device {
                        return Ok(None);
                    }
                }
                RendezvousVariable::OwnerOnly => {
                    if device {
                        return Ok(None);
                    }
                }
                RendezvousVariable::IPAddress => {
                    ip_addresses.push(instruction.ip_value()?);
                }
                RendezvousVariable::DevicePort => {
                    if device {
                        port = Some(instruction.value()?);
                    }
                }
                RendezvousVariable::OwnerPort => {
                    if !device {
                        port = Some(instruction.value()?);
                    }
                }
                RendezvousVariable::Dns => {
                    dns_name = Some(instruction.value()?);
                }
                RendezvousVariable::ServerCertHash => {
                    if device {
                        server_certificate_hash = Some(instruction.value()?);
                    }
                }
                RendezvousVariable::CaCertHash => {
                    if device {
                        ca_certificate_hash = Some(instruction.value()?);
                    }
                }
                RendezvousVariable::UserInput => {
                    user_input = device;
                }
                RendezvousVariable::WifiSsid => {
                    if device {
                        wifi_ssid = Some(instruction.value()?);
                    }
                }
                RendezvousVariable::WifiPw => {
                    if device {
                        wifi_password = Some(instruction.value()?);
                    }
                }
                RendezvousVariable::Medium => {
                    if device {
                        medium = Some(instruction.value()?);
                    }
                }
                RendezvousVariable::Protocol => {
                    protocol = RendezvousProtocolValue::from_u8(instruction.value()?)?;
                }
                RendezvousVariable::Delaysec => {
                    delay = instruction.value()?;
                }
                RendezvousVariable::Bypass => {
                    if device {
                        bypass = true;
                    } else {
                        // The owner never bypasses the rendezvous server
                        return Ok(None);
                    }
                }
                RendezvousVariable::ExtRV => {
                    log::debug!("Skipping directive with external rendezvous");
                    return Ok(None);
                }
            }
        }

        Ok(Some(RendezvousInterpretedDirective {
            ip_addresses,
            dns_name,
            port: port.or_else(|| protocol.default_port()).unwrap_or(443),
            server_certificate_hash,
            ca_certificate_hash,
            user_input,
            wifi_ssid,
            wifi_password,
            medium,
            protocol,
            delay,
            bypass,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::{
        RendezvousDirective, RendezvousInfo, RendezvousInstruction, RendezvousInterpreterSide,
    };
    use crate::{
        constants::{RendezvousProtocolValue, RendezvousVariable},
        Serializable,
    };

    #[test]
    fn test_interpret_sides() {
        let shared =
            RendezvousDirective::for_host("rv.example.com", 8082, RendezvousProtocolValue::Http)
                .unwrap();
        let device_only = RendezvousDirective::new(vec![
            RendezvousInstruction::new_marker(RendezvousVariable::DeviceOnly),
            RendezvousInstruction::new_ip(
                RendezvousVariable::IPAddress,
                &"::1".parse().unwrap(),
            )
            .unwrap(),
            RendezvousInstruction::new(RendezvousVariable::Protocol, &1u8).unwrap(),
        ]);
        let info = RendezvousInfo::new(vec![shared, device_only]).unwrap();
        let info = RendezvousInfo::deserialize_data(&info.serialize_data().unwrap()).unwrap();

        let device = info
            .to_interpreted(RendezvousInterpreterSide::Device)
            .unwrap();
        assert_eq!(device.len(), 2);
        assert_eq!(device[0].get_urls(), vec!["http://rv.example.com:8082"]);
        assert_eq!(device[1].get_urls(), vec!["http://[::1]:80"]);

        let owner = info
            .to_interpreted(RendezvousInterpreterSide::Owner)
            .unwrap();
        assert_eq!(owner.len(), 1);
    }

    #[test]
    fn test_directive_validation() {
        let no_address = RendezvousDirective::new(vec![RendezvousInstruction::new(
            RendezvousVariable::DevicePort,
            &8080u16,
        )
        .unwrap()]);
        assert!(RendezvousInfo::new(vec![no_address]).is_err());

        let duplicate = RendezvousDirective::new(vec![
            RendezvousInstruction::new(RendezvousVariable::Dns, &"a.example.com").unwrap(),
            RendezvousInstruction::new(RendezvousVariable::Dns, &"b.example.com").unwrap(),
        ]);
        assert!(RendezvousInfo::new(vec![duplicate]).is_err());

        let nobody = RendezvousDirective::new(vec![
            RendezvousInstruction::new_marker(RendezvousVariable::DeviceOnly),
            RendezvousInstruction::new_marker(RendezvousVariable::OwnerOnly),
            RendezvousInstruction::new(RendezvousVariable::Dns, &"a.example.com").unwrap(),
        ]);
        assert!(RendezvousInfo::new(vec![nobody]).is_err());

        let two_ips = RendezvousDirective::new(vec![
            RendezvousInstruction::new_ip(RendezvousVariable::IPAddress, &"10.0.0.1".parse().unwrap())
                .unwrap(),
            RendezvousInstruction::new_ip(RendezvousVariable::IPAddress, &"10.0.0.2".parse().unwrap())
                .unwrap(),
        ]);
        assert!(RendezvousInfo::new(vec![two_ips]).is_ok());
    }

    #[test]
    fn test_mistyped_value() {
        let directive = RendezvousDirective::new(vec![
            RendezvousInstruction::new(RendezvousVariable::Dns, &"a.example.com").unwrap(),
            RendezvousInstruction::new(RendezvousVariable::DevicePort, &"eighty").unwrap(),
        ]);
        let info = RendezvousInfo::new(vec![directive]).unwrap();
        assert!(info
            .to_interpreted(RendezvousInterpreterSide::Device)
            .is_err());
    }
}
