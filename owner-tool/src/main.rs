use std::{fs, io::Write, path::Path};

use anyhow::{bail, Context, Error, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use fdo_data_formats::{
    ownershipvoucher::{OwnershipVoucher, VoucherDBEntry},
    DeviceCredential, ProtocolVersion, Serializable,
};
use fdo_owner_tool::{
    build_certificate, describe_device_credential, describe_voucher, generate_key,
    initialize_device, load_private_key, load_public_key, load_rendezvous_info, KeyCurve,
};
use openssl::hash::MessageDigest;

#[derive(Parser)]
#[clap(version = "0.1")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generates a key pair with a self-signed certificate
    GenerateKey(GenerateKeyArguments),
    /// Initializes device token
    InitializeDevice(InitializeDeviceArguments),
    /// Prints ownership voucher contents
    DumpOwnershipVoucher(DumpOwnershipVoucherArguments),
    /// Prints device credential contents
    DumpDeviceCredential(DumpDeviceCredentialArguments),
    /// Extends an ownership voucher for a new owner
    ExtendOwnershipVoucher(ExtendOwnershipVoucherArguments),
    /// Pairs an ownership voucher with the final owner's private key for the owner server
    CreateOwnerEntry(CreateOwnerEntryArguments),
}

#[derive(Args)]
struct GenerateKeyArguments {
    /// Common name for the certificate
    subject: String,
    /// Output path for the private key
    key_out: String,
    /// Output path for the certificate
    cert_out: String,
    /// Curve to generate the key on
    #[clap(value_enum, long, default_value = "p256", action = ArgAction::Set)]
    curve: KeyCurve,
}

#[derive(Args)]
struct InitializeDeviceArguments {
    /// Identifier of the device
    device_id: String,
    /// Output path for ownership voucher
    ownershipvoucher_out: String,
    /// Output path for device credential
    device_credential_out: String,
    /// Path to the private key of the manufacturer
    #[clap(long, action = ArgAction::Set)]
    manufacturer_private_key: String,
    /// Path to a YAML file containing the rendezvous information
    #[clap(long, action = ArgAction::Set)]
    rendezvous_info: String,
    /// Curve for the device key
    #[clap(value_enum, long, default_value = "p256", action = ArgAction::Set)]
    curve: KeyCurve,
}

#[derive(Copy, Clone, ValueEnum)]
enum OutputFormat {
    Pem,
    Cose,
}

#[derive(Args)]
struct DumpOwnershipVoucherArguments {
    /// Path to the ownership voucher
    path: String,
    /// Output format
    #[clap(value_enum, long, required = false, action = ArgAction::Set)]
    outform: Option<OutputFormat>,
}

#[derive(Args)]
struct DumpDeviceCredentialArguments {
    /// Path to the device credential
    path: String,
}

#[derive(Args)]
struct ExtendOwnershipVoucherArguments {
    /// Path to the ownership voucher
    path: String,
    /// Path to the current owner private key
    #[clap(long, action = ArgAction::Set)]
    current_owner_private_key: String,
    /// Path to the new owner certificate or public key
    #[clap(long, action = ArgAction::Set)]
    new_owner_cert: String,
}

#[derive(Args)]
struct CreateOwnerEntryArguments {
    /// Path to the ownership voucher
    path: String,
    /// Path to the private key of the final owner
    #[clap(long, action = ArgAction::Set)]
    owner_private_key: String,
    /// Output path for the owner entry
    #[clap(long, action = ArgAction::Set)]
    output: String,
}

fn main() -> Result<()> {
    fdo_util::add_version!();
    fdo_http_wrapper::init_logging();

    match Cli::parse().command {
        Commands::GenerateKey(args) => generate_key_pair(&args),
        Commands::InitializeDevice(args) => initialize(&args),
        Commands::DumpOwnershipVoucher(args) => dump_voucher(&args),
        Commands::DumpDeviceCredential(args) => dump_devcred(&args),
        Commands::ExtendOwnershipVoucher(args) => extend_voucher(&args),
        Commands::CreateOwnerEntry(args) => create_owner_entry(&args),
    }
}

fn refuse_overwrite(path: &str, what: &str) -> Result<()> {
    if Path::new(path).exists() {
        bail!("{} file {} already exists", what, path);
    }
    Ok(())
}

fn read_voucher(path: &str) -> Result<OwnershipVoucher> {
    let cts = fs::read(path).context("Error reading ownership voucher")?;
    let ov =
        OwnershipVoucher::from_pem_or_raw(&cts).context("Error deserializing ownership voucher")?;
    if ov.protocol_version() != ProtocolVersion::Version1_1 as u16 {
        bail!(
            "Protocol version in OV ({}) not supported ({})",
            ov.protocol_version(),
            ProtocolVersion::Version1_1 as u16,
        );
    }
    Ok(ov)
}

fn generate_key_pair(args: &GenerateKeyArguments) -> Result<(), Error> {
    refuse_overwrite(&args.key_out, "Key")?;
    refuse_overwrite(&args.cert_out, "Certificate")?;

    let key = generate_key(args.curve)?;
    let digest = match args.curve {
        KeyCurve::P256 => MessageDigest::sha256(),
        KeyCurve::P384 => MessageDigest::sha384(),
    };
    let cert = build_certificate(&args.subject, &key, None, digest)?;

    fs::write(
        &args.key_out,
        key.private_key_to_pem_pkcs8()
            .context("Error serializing private key")?,
    )
    .context("Error writing private key")?;
    fs::write(
        &args.cert_out,
        cert.to_pem().context("Error serializing certificate")?,
    )
    .context("Error writing certificate")?;

    println!("Created key pair for {}", args.subject);
    Ok(())
}

fn initialize(args: &InitializeDeviceArguments) -> Result<(), Error> {
    let manufacturer_key = load_private_key(Path::new(&args.manufacturer_private_key))
        .context("Error loading manufacturer private key")?;
    let rendezvous_info = load_rendezvous_info(Path::new(&args.rendezvous_info))?;

    refuse_overwrite(&args.device_credential_out, "Device credential")?;
    refuse_overwrite(&args.ownershipvoucher_out, "Ownership voucher")?;

    let device = initialize_device(
        &args.device_id,
        &manufacturer_key,
        rendezvous_info,
        args.curve,
    )?;

    let ov = device
        .voucher
        .to_pem()
        .context("Error serializing ownership voucher")?;
    fs::write(&args.ownershipvoucher_out, ov).context("Error writing ownership voucher")?;
    device
        .credential
        .write_to_path(&args.device_credential_out)
        .context("Error writing device credential")?;

    println!(
        "Created ownership voucher for device {}",
        device.credential.device_guid()
    );

    Ok(())
}

fn dump_voucher(args: &DumpOwnershipVoucherArguments) -> Result<(), Error> {
    let ov = read_voucher(&args.path)?;

    if let Some(outform) = args.outform {
        let output = match outform {
            OutputFormat::Cose => ov
                .serialize_data()
                .context("Error serializing ownership voucher")?,
            OutputFormat::Pem => ov
                .to_pem()
                .context("Error serializing ownership voucher")?
                .into_bytes(),
        };
        std::io::stdout()
            .write_all(&output)
            .context("Error writing output")?;
        return Ok(());
    }

    print!("{}", describe_voucher(&ov)?);
    Ok(())
}

fn dump_devcred(args: &DumpDeviceCredentialArguments) -> Result<(), Error> {
    let dc = DeviceCredential::read_from_path(&args.path)
        .context("Error reading device credential")?;

    if dc.protocol_version() != ProtocolVersion::Version1_1 as u16 {
        bail!(
            "Protocol version in device credential ({}) not supported ({})",
            dc.protocol_version(),
            ProtocolVersion::Version1_1 as u16
        );
    }

    print!("{}", describe_device_credential(&dc)?);
    Ok(())
}

fn extend_voucher(args: &ExtendOwnershipVoucherArguments) -> Result<(), Error> {
    let mut ov = read_voucher(&args.path)?;

    let current_owner_private_key = load_private_key(Path::new(&args.current_owner_private_key))
        .context("Error loading current owner private key")?;
    let new_owner_pubkey = load_public_key(Path::new(&args.new_owner_cert))
        .context("Error loading new owner public key")?;

    ov.extend(&current_owner_private_key, &new_owner_pubkey)
        .context("Error extending ownership voucher")?;

    // Write out
    let newname = format!("{}.new", args.path);
    {
        // A new scope, to ensure the file gets closed before we move it
        let ov = ov.to_pem().context("Error serializing ownership voucher")?;
        fs::write(&newname, ov).with_context(|| format!("Error writing to {}", newname))?;
    }

    fs::rename(newname, &args.path).context("Error moving new ownership voucher in place")?;
    log::info!(
        "Extended ownership voucher {} to {} entries",
        args.path,
        ov.num_entries()
    );

    Ok(())
}

fn create_owner_entry(args: &CreateOwnerEntryArguments) -> Result<(), Error> {
    let ov = read_voucher(&args.path)?;
    let owner_key = load_private_key(Path::new(&args.owner_private_key))
        .context("Error loading owner private key")?;
    refuse_overwrite(&args.output, "Owner entry")?;

    if !ov
        .final_owner_public_key()
        .context("Error reading final owner key")?
        .matches_pkey(&owner_key)
    {
        bail!("Private key does not belong to the final owner of the voucher");
    }
    ov.validate().context("Ownership voucher does not validate")?;

    let guid = ov.header()?.guid().clone();
    let entry = VoucherDBEntry::new(ov, &owner_key).context("Error building owner entry")?;
    fs::write(
        &args.output,
        entry.to_pem().context("Error serializing owner entry")?,
    )
    .context("Error writing owner entry")?;

    println!("Created owner entry for device {}", guid);
    Ok(())
}
