//! Inspection tool: prints the certificates and CRLs found in a trust
//! directory the way the server would parse them.

use chrono::{TimeZone, Utc};
use clap::{App, Arg};
use flint::cert::{Certificate, Crl};
use std::fs;
use std::path::Path;

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

fn timestamp(secs: i64) -> String {
    match Utc.timestamp_opt(secs, 0).single() {
        Some(time) => time.to_rfc3339(),
        None => format!("@{}", secs),
    }
}

fn dump_file(path: &Path) {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("{}: unreadable ({})", path.display(), err);
            return;
        }
    };

    if let Ok(cert) = Certificate::parse(&bytes) {
        println!("{}", path.display());
        println!("  kind:       certificate{}", if cert.is_ca() { " (CA)" } else { "" });
        println!("  subject:    {}", cert.subject());
        println!("  issuer:     {}", cert.issuer());
        println!("  serial:     {}", hex(cert.serial()));
        println!("  thumbprint: {}", hex(cert.thumbprint()));
        println!("  key bits:   {}", cert.key_bits());
        for entry in cert.san() {
            println!("  san:        {:?}", entry);
        }
        return;
    }

    if let Ok(crl) = Crl::parse(&bytes) {
        println!("{}", path.display());
        println!("  kind:       crl");
        println!("  issuer:     {}", crl.issuer());
        println!("  this update: {}", timestamp(crl.this_update()));
        return;
    }

    eprintln!("{}: neither a certificate nor a CRL", path.display());
}

pub fn main() {
    let matches = App::new("Trust Directory Dump")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Prints the parsed view of certificates and CRLs in a directory.")
        .arg(
            Arg::with_name("DIR")
                .help("Directory holding DER or PEM certificates and CRLs")
                .required(true),
        )
        .get_matches();

    let dir = Path::new(matches.value_of("DIR").unwrap());
    let mut entries: Vec<_> = fs::read_dir(dir)
        .expect("Error reading directory")
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    entries.sort();

    for path in entries {
        dump_file(&path);
    }
}
