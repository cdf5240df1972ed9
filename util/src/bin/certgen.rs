//! Bootstrap tool: generates an RSA key pair and a self-signed application
//! certificate for a fresh server identity.

use clap::{App, Arg};
use flint::cert::SanEntry;
use flint::{crypto, forge};
use rsa::pkcs8::EncodePrivateKey;
use std::fs;
use std::path::Path;

pub fn main() {
    let matches = App::new("Certificate Generator")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Generates a self-signed server certificate and private key.")
        .arg(
            Arg::with_name("OUT_DIR")
                .help("Directory the certificate and key are written to")
                .required(true),
        )
        .arg(
            Arg::with_name("subject")
                .long("subject")
                .takes_value(true)
                .default_value("CN=girder-server,O=Bush Hammer Industries"),
        )
        .arg(
            Arg::with_name("uri")
                .long("uri")
                .help("Application URI placed in the subject alternative names")
                .takes_value(true)
                .default_value("urn:bushhammer:girder:server"),
        )
        .arg(
            Arg::with_name("dns")
                .long("dns")
                .help("DNS name placed in the subject alternative names")
                .takes_value(true)
                .multiple(true),
        )
        .arg(
            Arg::with_name("bits")
                .long("bits")
                .takes_value(true)
                .default_value("2048"),
        )
        .arg(
            Arg::with_name("days")
                .long("days")
                .takes_value(true)
                .default_value("365"),
        )
        .get_matches();

    let out_dir = Path::new(matches.value_of("OUT_DIR").unwrap());
    let subject = matches.value_of("subject").unwrap();
    let bits: usize = matches.value_of("bits").unwrap().parse().expect("Invalid key size");
    let days: u64 = matches.value_of("days").unwrap().parse().expect("Invalid validity");

    let mut san = vec![SanEntry::Uri(matches.value_of("uri").unwrap().to_string())];
    if let Some(names) = matches.values_of("dns") {
        for name in names {
            san.push(SanEntry::Dns(name.to_string()));
        }
    }

    println!("Generating {} bit RSA key...", bits);
    let key = crypto::generate_rsa_key(bits).expect("Key generation failed");

    let cert = forge::create_self_signed(&key, subject, &san, days).expect("Certificate build failed");

    fs::create_dir_all(out_dir).expect("Error creating output directory");
    fs::write(out_dir.join("server.der"), cert.der()).expect("Error writing certificate");

    let key_pem = key
        .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
        .expect("Key encoding failed");
    fs::write(out_dir.join("server.key"), key_pem.as_bytes()).expect("Error writing private key");

    println!("Wrote {}", out_dir.join("server.der").display());
    println!("Wrote {}", out_dir.join("server.key").display());
    println!("Subject:    {}", cert.subject());
    println!(
        "Thumbprint: {}",
        cert.thumbprint().iter().map(|byte| format!("{:02x}", byte)).collect::<String>()
    );
}
