use std::{fmt::Write, fs, path::Path};

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::BigNum,
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, PKeyRef, Private, Public},
    rand::rand_bytes,
    x509::{
        extension::{BasicConstraints, KeyUsage},
        X509Builder, X509NameBuilder, X509,
    },
};
use serde_yaml::Value;

use fdo_data_formats::{
    constants::{HashType, RendezvousProtocolValue, RendezvousVariable},
    ownershipvoucher::{OwnershipVoucher, OwnershipVoucherHeader},
    publickey::{PublicKey, X5Chain},
    rendezvous::{RendezvousDirective, RendezvousInfo, RendezvousInstruction},
    types::{Guid, HMac, IPAddress},
    DeviceCredential, Serializable,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum KeyCurve {
    P256,
    P384,
}

impl KeyCurve {
    fn nid(&self) -> Nid {
        match self {
            KeyCurve::P256 => Nid::X9_62_PRIME256V1,
            KeyCurve::P384 => Nid::SECP384R1,
        }
    }

    fn digest(&self) -> MessageDigest {
        match self {
            KeyCurve::P256 => MessageDigest::sha256(),
            KeyCurve::P384 => MessageDigest::sha384(),
        }
    }

    /// The device HMAC algorithm paired with keys of this curve
    pub fn hmac_type(&self) -> HashType {
        match self {
            KeyCurve::P256 => HashType::HmacSha256,
            KeyCurve::P384 => HashType::HmacSha384,
        }
    }
}

pub fn generate_key(curve: KeyCurve) -> Result<PKey<Private>> {
    let group = EcGroup::from_curve_name(curve.nid()).context("Error getting curve group")?;
    let key = EcKey::generate(&group).context("Error generating key")?;
    PKey::from_ec_key(key).context("Error converting key to pkey")
}

pub fn public_key_of(key: &PKeyRef<Private>) -> Result<PKey<Public>> {
    let der = key
        .public_key_to_der()
        .context("Error serializing public key")?;
    PKey::public_key_from_der(&der).context("Error parsing public key")
}

/// Builds a certificate for `subject_key`. Without an issuer the result is a
/// self-signed CA certificate.
pub fn build_certificate(
    subject_cn: &str,
    subject_key: &PKeyRef<Private>,
    issuer: Option<(&X509, &PKeyRef<Private>)>,
    digest: MessageDigest,
) -> Result<X509> {
    let mut subject = X509NameBuilder::new().context("Error building subject")?;
    subject
        .append_entry_by_text("CN", subject_cn)
        .context("Error building subject")?;
    let subject = subject.build();

    let mut builder = X509Builder::new().context("Error creating X509Builder")?;
    builder.set_version(2).context("Error setting version")?;

    // 64 bits from a CSPRNG, per section 7.1 of the CA/Browser Forum Baseline Requirements
    let mut serial_buf = [0; 8];
    rand_bytes(&mut serial_buf).context("Error generating serial number")?;
    let serial = BigNum::from_slice(&serial_buf).context("Error parsing serial number")?;
    let serial = Asn1Integer::from_bn(&serial).context("Error converting serial number to asn1")?;
    builder
        .set_serial_number(serial.as_ref())
        .context("Error setting serial number")?;

    let not_before = Asn1Time::days_from_now(0).context("Error building not-before")?;
    builder
        .set_not_before(&not_before)
        .context("Error setting not-before")?;
    let not_after = Asn1Time::days_from_now(3650).context("Error building not-after")?;
    builder
        .set_not_after(&not_after)
        .context("Error setting not-after")?;
    builder
        .set_subject_name(&subject)
        .context("Error setting subject name")?;
    builder
        .set_pubkey(subject_key)
        .context("Error setting public key")?;

    let signer = match issuer {
        Some((issuer_cert, issuer_key)) => {
            builder
                .set_issuer_name(issuer_cert.subject_name())
                .context("Error setting issuer name")?;
            builder.append_extension(BasicConstraints::new().build()?)?;
            builder.append_extension(KeyUsage::new().digital_signature().build()?)?;
            issuer_key
        }
        None => {
            builder
                .set_issuer_name(&subject)
                .context("Error setting issuer name")?;
            builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
            builder.append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .build()?,
            )?;
            subject_key
        }
    };

    builder
        .sign(signer, digest)
        .context("Error signing certificate")?;
    Ok(builder.build())
}

/// Reads a PEM or DER private key
pub fn load_private_key(path: &Path) -> Result<PKey<Private>> {
    let contents =
        fs::read(path).with_context(|| format!("Error reading key at {}", path.display()))?;
    PKey::private_key_from_pem(&contents)
        .or_else(|_| PKey::private_key_from_der(&contents))
        .with_context(|| format!("Error parsing private key at {}", path.display()))
}

/// Reads a PEM certificate or PEM public key
pub fn load_public_key(path: &Path) -> Result<PublicKey> {
    let contents =
        fs::read(path).with_context(|| format!("Error reading key at {}", path.display()))?;
    if let Ok(cert) = X509::from_pem(&contents) {
        return PublicKey::try_from(cert).context("Error converting certificate");
    }
    let key = PKey::public_key_from_pem(&contents)
        .with_context(|| format!("Error parsing public key at {}", path.display()))?;
    PublicKey::from_pkey(&key).context("Error converting public key")
}

fn yaml_str(value: &Value) -> Result<&str> {
    match value {
        Value::String(s) => Ok(s),
        _ => bail!("Expected a string, got {:?}", value),
    }
}

fn yaml_uint(value: &Value) -> Result<u64> {
    match value.as_u64() {
        Some(v) => Ok(v),
        None => bail!("Expected an unsigned integer, got {:?}", value),
    }
}

fn rendezvous_instruction(
    variable: RendezvousVariable,
    value: &Value,
) -> Result<RendezvousInstruction> {
    Ok(match variable {
        RendezvousVariable::DeviceOnly
        | RendezvousVariable::OwnerOnly
        | RendezvousVariable::UserInput
        | RendezvousVariable::Bypass => match value {
            Value::Null | Value::Bool(true) => RendezvousInstruction::new_marker(variable),
            _ => bail!("{:?} is a flag and takes no value", variable),
        },
        RendezvousVariable::IPAddress => {
            let ip: IPAddress = yaml_str(value)?.parse().context("Invalid IP address")?;
            RendezvousInstruction::new_ip(variable, &ip)?
        }
        RendezvousVariable::DevicePort | RendezvousVariable::OwnerPort => {
            let port = u16::try_from(yaml_uint(value)?).context("Invalid port")?;
            RendezvousInstruction::new(variable, &port)?
        }
        RendezvousVariable::Dns | RendezvousVariable::WifiSsid | RendezvousVariable::WifiPw => {
            RendezvousInstruction::new(variable, &yaml_str(value)?)?
        }
        RendezvousVariable::Protocol => {
            let protocol: RendezvousProtocolValue = yaml_str(value)?.parse()?;
            RendezvousInstruction::new(variable, &(protocol as u8))?
        }
        RendezvousVariable::Delaysec => {
            let delay = u32::try_from(yaml_uint(value)?).context("Invalid delay")?;
            RendezvousInstruction::new(variable, &delay)?
        }
        RendezvousVariable::Medium => {
            let medium = u8::try_from(yaml_uint(value)?).context("Invalid medium")?;
            RendezvousInstruction::new(variable, &medium)?
        }
        RendezvousVariable::ServerCertHash
        | RendezvousVariable::CaCertHash
        | RendezvousVariable::ExtRV => {
            bail!("Rendezvous variable {:?} can't be configured here", variable)
        }
    })
}

/// Parses a YAML list of directives, each a mapping of variable name to value
pub fn parse_rendezvous_info(contents: &str) -> Result<RendezvousInfo> {
    let value: Value = serde_yaml::from_str(contents).context("Error parsing rendezvous info")?;
    let directives = match value {
        Value::Sequence(vals) => vals,
        _ => bail!("Invalid yaml top type"),
    };

    let mut info = Vec::new();
    for directive in directives {
        let directive = match directive {
            Value::Mapping(map) => map,
            _ => bail!("Invalid entry type"),
        };

        let mut instructions = Vec::new();
        for (key, val) in directive.iter() {
            let key = yaml_str(key).context("Invalid key type")?;
            let variable: RendezvousVariable = key
                .parse()
                .with_context(|| format!("Error parsing rendezvous key '{}'", key))?;
            instructions.push(
                rendezvous_instruction(variable, val)
                    .with_context(|| format!("Error parsing value for key '{}'", key))?,
            );
        }
        info.push(RendezvousDirective::new(instructions));
    }

    RendezvousInfo::new(info).context("Invalid rendezvous info")
}

pub fn load_rendezvous_info(path: &Path) -> Result<RendezvousInfo> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Error reading rendezvous info at {}", path.display()))?;
    parse_rendezvous_info(&contents)
}

/// The two artifacts produced for a freshly manufactured device
#[derive(Debug)]
pub struct InitializedDevice {
    pub credential: DeviceCredential,
    pub voucher: OwnershipVoucher,
}

pub fn initialize_device(
    device_info: &str,
    manufacturer_key: &PKeyRef<Private>,
    rendezvous_info: RendezvousInfo,
    curve: KeyCurve,
) -> Result<InitializedDevice> {
    // Device CA -> device leaf
    let device_ca_key = generate_key(curve).context("Error generating device CA key")?;
    let device_ca_cert = build_certificate(
        &format!("{} Device CA", device_info),
        &device_ca_key,
        None,
        curve.digest(),
    )
    .context("Error building device CA certificate")?;
    let device_key = generate_key(curve).context("Error generating device key")?;
    let device_cert = build_certificate(
        device_info,
        &device_key,
        Some((&device_ca_cert, &device_ca_key)),
        curve.digest(),
    )
    .context("Error building device certificate")?;
    let device_cert_chain =
        X5Chain::new(vec![device_cert, device_ca_cert]).context("Error creating X5Chain")?;

    let hmac_type = curve.hmac_type();
    let hash_type = hmac_type.inner_hash();
    let mut hmac_secret = vec![0; hash_type.digest_size()];
    rand_bytes(&mut hmac_secret).context("Error creating random device HMAC key")?;

    let device_guid = Guid::new().context("Error generating guid")?;
    let manufacturer_pub = public_key_of(manufacturer_key)?;
    let manufacturer_pubkey = PublicKey::from_pkey(&manufacturer_pub)
        .context("Error creating manufacturer public key representation")?;

    let ov_header = OwnershipVoucherHeader::new(
        device_guid.clone(),
        rendezvous_info.clone(),
        device_info.to_string(),
        manufacturer_pubkey.clone(),
        Some(
            device_cert_chain
                .hash(hash_type)
                .context("Error hashing device cert chain")?,
        ),
    )
    .context("Error creating new OwnershipVoucher Header")?;
    let ov_hmac = HMac::hmac_from_data(
        hmac_type,
        &hmac_secret,
        &ov_header
            .serialize_data()
            .context("Error serializing Ownership Voucher header")?,
    )
    .context("Error computing header HMAC")?;
    let voucher = OwnershipVoucher::new(&ov_header, ov_hmac, Some(device_cert_chain.clone()))
        .context("Error building ownership voucher")?;

    let credential = DeviceCredential::new(
        hmac_secret,
        hmac_type,
        device_info.to_string(),
        device_guid,
        rendezvous_info,
        manufacturer_pubkey
            .hash(hash_type)
            .context("Error computing manufacturer public key hash")?,
        &device_key,
        device_cert_chain,
    )
    .context("Error building device credential")?;

    Ok(InitializedDevice {
        credential,
        voucher,
    })
}

pub fn describe_voucher(ov: &OwnershipVoucher) -> Result<String> {
    let ov_header = ov.header().context("Error parsing voucher header")?;
    let mut out = String::new();

    writeln!(out, "Header:")?;
    writeln!(out, "\tProtocol Version: {}", ov_header.protocol_version())?;
    writeln!(out, "\tDevice GUID: {}", ov_header.guid())?;
    writeln!(out, "\tRendezvous Info:")?;
    for rv_entry in ov_header.rendezvous_info().values() {
        writeln!(out, "\t\t- {:?}", rv_entry)?;
    }
    writeln!(out, "\tDevice Info: {:?}", ov_header.device_info())?;
    writeln!(out, "\tManufacturer public key: {}", ov_header.public_key())?;
    match ov_header.device_certificate_chain_hash() {
        None => writeln!(out, "\tDevice certificate chain hash: <none>")?,
        Some(v) => writeln!(out, "\tDevice certificate chain hash: {:?}", v)?,
    }
    writeln!(out, "Header HMAC: {:?}", ov.header_hmac())?;

    writeln!(out, "Device certificate chain:")?;
    match ov.device_certificate_chain() {
        None => writeln!(out, "\t<none>")?,
        Some(v) => {
            for (num, cert) in v.chain().iter().enumerate() {
                writeln!(out, "\tCertificate {}: {:?}", num, cert.subject_name())?;
            }
        }
    }

    writeln!(out, "Entries:")?;
    for (pos, entry) in ov
        .iter_entries()
        .context("Error creating OV iterator")?
        .enumerate()
    {
        let entry = entry.with_context(|| format!("Error parsing entry {}", pos))?;
        writeln!(out, "\tEntry {}", pos)?;
        writeln!(out, "\t\tPrevious entry hash: {:?}", entry.hash_previous_entry())?;
        writeln!(out, "\t\tHeader info hash: {:?}", entry.hash_header_info())?;
        writeln!(out, "\t\tPublic key: {}", entry.public_key())?;
    }

    Ok(out)
}

pub fn describe_device_credential(dc: &DeviceCredential) -> Result<String> {
    let mut out = String::new();
    writeln!(out, "Active: {}", dc.is_active())?;
    writeln!(out, "Protocol Version: {}", dc.protocol_version())?;
    writeln!(out, "Device Info: {}", dc.device_info())?;
    writeln!(out, "Device GUID: {}", dc.device_guid())?;
    writeln!(out, "Rendezvous Info:")?;
    for rv_entry in dc.rendezvous_info().values() {
        writeln!(out, "\t- {:?}", rv_entry)?;
    }
    writeln!(out, "Public key hash: {:?}", dc.manufacturer_pubkey_hash())?;
    writeln!(out, "Signature type: {:?}", dc.sig_info().sig_type())?;
    writeln!(out, "HMAC key: <secret>")?;
    writeln!(out, "Signing key: <secret>")?;
    Ok(out)
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use fdo_data_formats::{
        constants::RendezvousVariable,
        rendezvous::RendezvousInterpreterSide,
        DeviceCredential, Serializable,
    };
    use pretty_assertions::assert_eq;

    use super::{
        describe_voucher, generate_key, initialize_device, load_rendezvous_info,
        parse_rendezvous_info, public_key_of, KeyCurve,
    };

    const RV_YAML: &str = r#"
- dns: rendezvous.example.com
  device_port: 8082
  owner_port: 8082
  protocol: http
- ip_address: 192.0.2.10
  device_port: 8443
  protocol: https
  delay_sec: 30
  device_only: true
"#;

    #[test]
    fn test_parse_rendezvous_info() {
        let info = parse_rendezvous_info(RV_YAML).unwrap();
        assert_eq!(info.values().len(), 2);
        assert_eq!(
            info.values()[1].instructions()[4].variable(),
            RendezvousVariable::DeviceOnly
        );

        let device = info
            .to_interpreted(RendezvousInterpreterSide::Device)
            .unwrap();
        assert_eq!(device.len(), 2);
        assert_eq!(
            device[0].get_urls(),
            vec!["http://rendezvous.example.com:8082".to_string()]
        );
        assert_eq!(device[1].delay(), 30);

        // The second directive is for devices only
        let owner = info
            .to_interpreted(RendezvousInterpreterSide::Owner)
            .unwrap();
        assert_eq!(owner.len(), 1);

        assert!(parse_rendezvous_info("- server_cert_hash: abc").is_err());
        assert!(parse_rendezvous_info("dns: foo").is_err());
    }

    #[test]
    fn test_initialize_and_extend() {
        let mut rv_file = tempfile::NamedTempFile::new().unwrap();
        rv_file.write_all(RV_YAML.as_bytes()).unwrap();
        let rvinfo = load_rendezvous_info(rv_file.path()).unwrap();

        let manufacturer_key = generate_key(KeyCurve::P256).unwrap();
        let device =
            initialize_device("test-device", &manufacturer_key, rvinfo, KeyCurve::P256).unwrap();

        // No owner has been added yet
        assert_eq!(device.voucher.num_entries(), 0);
        assert!(device.voucher.validate().is_err());
        device
            .credential
            .verify_hmac(device.voucher.header_raw(), device.voucher.header_hmac())
            .unwrap();

        let credential =
            DeviceCredential::deserialize_data(&device.credential.serialize_data().unwrap())
                .unwrap();
        assert_eq!(credential.device_guid(), device.credential.device_guid());

        // Manufacturer hands the device to an owner
        let owner_key = generate_key(KeyCurve::P256).unwrap();
        let owner_pub =
            fdo_data_formats::publickey::PublicKey::from_pkey(&public_key_of(&owner_key).unwrap())
                .unwrap();
        let mut voucher = device.voucher.clone();
        voucher.extend(&manufacturer_key, &owner_pub).unwrap();
        let header = voucher.validate().unwrap();
        assert_eq!(header.guid(), device.credential.device_guid());
        device.credential.check_voucher_header(&header).unwrap();
        assert!(voucher
            .final_owner_public_key()
            .unwrap()
            .matches_pkey(&owner_key));
        assert!(voucher.extend(&manufacturer_key, &owner_pub).is_err());

        let description = describe_voucher(&voucher).unwrap();
        assert!(description.contains(&header.guid().to_string()));
        assert!(description.contains("Entry 0"));
    }

    #[test]
    fn test_p384_device() {
        let rvinfo = parse_rendezvous_info(RV_YAML).unwrap();
        let manufacturer_key = generate_key(KeyCurve::P384).unwrap();
        let device =
            initialize_device("p384-device", &manufacturer_key, rvinfo, KeyCurve::P384).unwrap();
        assert_eq!(
            device.credential.hmac_alg(),
            fdo_data_formats::constants::HashType::HmacSha384
        );
        assert!(device.voucher.validate().is_err());

        let owner_key = generate_key(KeyCurve::P384).unwrap();
        let owner_pub = public_key_of(&owner_key).unwrap();
        let owner_pub = fdo_data_formats::publickey::PublicKey::from_pkey(&owner_pub).unwrap();
        let mut voucher = device.voucher;
        voucher.extend(&manufacturer_key, &owner_pub).unwrap();
        let header = voucher.validate().unwrap();
        device.credential.check_voucher_header(&header).unwrap();
    }
}
