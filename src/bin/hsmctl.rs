//! hsmctl: drive the simulated secure element from the command line
//!
//! Commands:
//!   hsmctl demo                              walk through sessions, keys, groups and commits
//!   hsmctl info                              chip information
//!   hsmctl caps   <full|qxp|dxl>             print a platform capability table
//!   hsmctl keygen <store> <nonce> <type> [group]
//!   hsmctl data   put <store> <nonce> <id> <text> | get <store> <nonce> <id>
//!   hsmctl stress [stores] [keys]            parallel strict commits on independent stores

use hsm_flows::algo::{CipherAlgo, KeyType, SignatureScheme};
use hsm_flows::auth::HmacAuthority;
use hsm_flows::engine::Direction;
use hsm_flows::flags::{KeyGenFlags, KeyGroupFlags, KeyInfo, SignFlags, VerifyFlags};
use hsm_flows::flow::{CipherArgs, GenerateKeyArgs, SignArgs, VerifyArgs, VerifyKey};
use hsm_flows::{
    CapabilityTable, FileNvm, FlowKind, Handle, Hsm, HsmConfig, HsmError, InMemoryNvm, NvmStore,
    OpenKeyStoreArgs, SessionConfig, SimulatedEngine,
};
use std::env;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

const NVM_DIR: &str = "hsm-nvm";
const CONFIG_FILE: &str = "hsm-config.json";
const DEFAULT_AUTH_SECRET: &str = "hsmctl-development-secret";
const MAX_UPDATES: u16 = 1000;

type CmdResult = Result<(), Box<dyn Error>>;

fn print_usage() {
    println!(
        r#"
╔══════════════════════════════════════════════════════════════╗
║        hsmctl: simulated secure element                      ║
║        sessions · key stores · anti-rollback commits         ║
╚══════════════════════════════════════════════════════════════╝

Usage: hsmctl <command> [options]

Commands:
  demo                                       Run an in-memory walkthrough
  info                                       Show chip information
  caps   <full|qxp|dxl>                      Print a capability table as JSON
  keygen <store> <nonce> <type> [group]      Generate and commit a key
  data   put <store> <nonce> <id> <text>     Store a data blob
  data   get <store> <nonce> <id>            Read a data blob back
  stress [stores] [keys]                     Parallel strict commits

Key types: aes128 aes192 aes256 p256 p384 p521 sm2 sm4 hmac256 hmac384, or a hex code

Environment:
  HSM_AUTH_SECRET   secret of the provisioning authority
  RUST_LOG          log filter (default: info)

Files:
  hsm-config.json   optional configuration, defaults when absent
  hsm-nvm/          file backed NVM
"#
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let result = match args[1].as_str() {
        "demo" => cmd_demo(),
        "info" => cmd_info(),
        "caps" => cmd_caps(&args[2..]),
        "keygen" => cmd_keygen(&args[2..]),
        "data" => cmd_data(&args[2..]),
        "stress" => cmd_stress(&args[2..]).await,
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            Ok(())
        }
    };
    if let Err(e) = result {
        eprintln!("  Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config() -> HsmConfig {
    if Path::new(CONFIG_FILE).exists() {
        match HsmConfig::load(CONFIG_FILE) {
            Ok(config) => return config,
            Err(e) => eprintln!("  Ignoring {}: {}", CONFIG_FILE, e),
        }
    }
    HsmConfig::default()
}

fn authority() -> HmacAuthority {
    let secret = env::var("HSM_AUTH_SECRET").unwrap_or_else(|_| DEFAULT_AUTH_SECRET.to_string());
    HmacAuthority::new(secret.into_bytes())
}

fn boot(nvm: Arc<dyn NvmStore>) -> Result<Hsm, HsmError> {
    let config = load_config();
    let engine = Arc::new(SimulatedEngine::new(config.identity.chip_unique_id));
    Hsm::new(config, engine, nvm, Arc::new(authority()))
}

fn boot_file_nvm() -> Result<Hsm, Box<dyn Error>> {
    let nvm = FileNvm::open(NVM_DIR)?;
    Ok(boot(Arc::new(nvm))?)
}

/// Attach to a store, creating it on first use
fn open_store(hsm: &Hsm, session: Handle, id: u32, nonce: u32) -> Result<Handle, HsmError> {
    let opened = match hsm.open_key_store(session, &OpenKeyStoreArgs::attach(id, nonce)) {
        Err(HsmError::UnknownKeyStore(_)) => {
            println!("  Creating key store {}", id);
            hsm.open_key_store(session, &OpenKeyStoreArgs::create(id, nonce, MAX_UPDATES))?
        }
        other => other?,
    };
    opened
        .handle()
        .ok_or_else(|| HsmError::GeneralError("key store open returned no handle".into()))
}

fn parse<T: std::str::FromStr>(value: Option<&String>, what: &str) -> Result<T, Box<dyn Error>> {
    let raw = value.ok_or_else(|| format!("missing {}", what))?;
    raw.parse::<T>()
        .map_err(|_| format!("{} must be a number, got '{}'", what, raw).into())
}

fn parse_key_type(name: &str) -> Result<KeyType, Box<dyn Error>> {
    let key_type = match name.to_ascii_lowercase().as_str() {
        "aes128" => KeyType::Aes128,
        "aes192" => KeyType::Aes192,
        "aes256" => KeyType::Aes256,
        "p256" => KeyType::EcdsaNistP256,
        "p384" => KeyType::EcdsaNistP384,
        "p521" => KeyType::EcdsaNistP521,
        "sm2" => KeyType::DsaSm2Fp256,
        "sm4" => KeyType::Sm4_128,
        "hmac256" => KeyType::Hmac256,
        "hmac384" => KeyType::Hmac384,
        code => {
            let code = u8::from_str_radix(code.trim_start_matches("0x"), 16)
                .map_err(|_| format!("unknown key type '{}'", name))?;
            KeyType::from_code(code)?
        }
    };
    Ok(key_type)
}

fn cmd_info() -> CmdResult {
    let hsm = boot_file_nvm()?;
    let session = hsm.open_session(SessionConfig::default())?;
    let info = hsm.get_info(session)?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    println!("  Platform: {}", hsm.config().capabilities.name);
    hsm.close_session(session)?;
    Ok(())
}

fn cmd_caps(args: &[String]) -> CmdResult {
    let name = args.first().map(String::as_str).unwrap_or("full");
    let caps = CapabilityTable::preset(name).ok_or_else(|| format!("unknown preset '{}'", name))?;
    println!("{}", serde_json::to_string_pretty(&caps)?);
    Ok(())
}

fn cmd_keygen(args: &[String]) -> CmdResult {
    if args.len() < 3 {
        eprintln!("Usage: hsmctl keygen <store> <nonce> <type> [group]");
        return Ok(());
    }
    let store: u32 = parse(args.first(), "store")?;
    let nonce: u32 = parse(args.get(1), "nonce")?;
    let key_type = parse_key_type(&args[2])?;
    let group: u16 = match args.get(3) {
        Some(_) => parse(args.get(3), "group")?,
        None => 1,
    };

    let hsm = boot_file_nvm()?;
    let session = hsm.open_session(SessionConfig::default())?;
    let ks = open_store(&hsm, session, store, nonce)?;
    let km = hsm.open_service(ks, FlowKind::KeyManagement)?;
    let mut gen = GenerateKeyArgs::create(key_type, group, KeyInfo::empty());
    gen.flags |= KeyGenFlags::STRICT_OPERATION;
    let outcome = hsm.generate_key(km, &gen)?;

    println!("  Key id:  {:#010x}", outcome.key_id);
    println!("  Type:    {:?}", key_type);
    println!("  Group:   {}", group);
    if let Some(public) = &outcome.public_key {
        println!("  Public:  {}", hex::encode(public));
    }
    println!("  Commit:  {:?}", outcome.status);
    hsm.close_session(session)?;
    Ok(())
}

fn cmd_data(args: &[String]) -> CmdResult {
    let action = args.first().map(String::as_str).unwrap_or("");
    if !matches!(action, "put" | "get") || args.len() < 4 {
        eprintln!("Usage: hsmctl data put <store> <nonce> <id> <text> | get <store> <nonce> <id>");
        return Ok(());
    }
    let store: u32 = parse(args.get(1), "store")?;
    let nonce: u32 = parse(args.get(2), "nonce")?;
    let data_id: u16 = parse(args.get(3), "data id")?;

    let hsm = boot_file_nvm()?;
    let session = hsm.open_session(SessionConfig::default())?;
    let ks = open_store(&hsm, session, store, nonce)?;
    let flow = hsm.open_service(ks, FlowKind::DataStorage)?;
    if action == "put" {
        let text = args[4..].join(" ");
        hsm.store_data(flow, data_id, text.as_bytes())?;
        println!("  Stored {} bytes as data {} in key store {}", text.len(), data_id, store);
    } else {
        let data = hsm.retrieve_data(flow, data_id)?;
        match String::from_utf8(data) {
            Ok(text) => println!("  {}", text),
            Err(e) => println!("  {}", hex::encode(e.as_bytes())),
        }
    }
    hsm.close_session(session)?;
    Ok(())
}

fn cmd_demo() -> CmdResult {
    println!("\n  ═══ hsmctl demo ═══\n");
    let nvm = Arc::new(InMemoryNvm::new());
    let hsm = boot(nvm.clone())?;

    println!("  [1] Session and key store");
    let session = hsm.open_session(SessionConfig::default())?;
    let ks = hsm
        .open_key_store(session, &OpenKeyStoreArgs::create(0x10, 0xCAFE, 3))?
        .handle()
        .ok_or("no key store handle")?;
    println!("      session {}  key store {}", session, ks);

    println!("  [2] Strict AES-256 key, committed under counter 1");
    let km = hsm.open_service(ks, FlowKind::KeyManagement)?;
    let mut gen = GenerateKeyArgs::create(KeyType::Aes256, 1, KeyInfo::empty());
    gen.flags |= KeyGenFlags::STRICT_OPERATION;
    let aes = hsm.generate_key(km, &gen)?;
    println!("      key {:#x}  {:?}", aes.key_id, aes.status);

    println!("  [3] Cipher round trip");
    let cipher = hsm.open_service(ks, FlowKind::Cipher)?;
    let mut args = CipherArgs {
        key_id: aes.key_id,
        algo: CipherAlgo::AesCbc,
        direction: Direction::Encrypt,
        iv: vec![0x42; 16],
        input: b"secure element!!".to_vec(),
    };
    let sealed = hsm.cipher_one_go(cipher, &args)?;
    args.direction = Direction::Decrypt;
    args.input = sealed.clone();
    let plain = hsm.cipher_one_go(cipher, &args)?;
    println!("      {} -> {}", hex::encode(&sealed), String::from_utf8_lossy(&plain));

    println!("  [4] P-256 signature, verified through a session flow");
    let ecc = hsm.generate_key(
        km,
        &GenerateKeyArgs::create(KeyType::EcdsaNistP256, 2, KeyInfo::empty()),
    )?;
    let sign = hsm.open_service(ks, FlowKind::SignatureGeneration)?;
    let scheme = SignatureScheme::EcdsaNistP256Sha256;
    hsm.prepare_signature(sign, scheme)?;
    let signature = hsm.generate_signature(
        sign,
        &SignArgs {
            key_id: ecc.key_id,
            scheme,
            input: b"boot image".to_vec(),
            flags: SignFlags::INPUT_MESSAGE | SignFlags::LOW_LATENCY_SIGNATURE,
        },
    )?;
    let verify = hsm.open_service(session, FlowKind::SignatureVerification)?;
    let status = hsm.verify_signature(
        verify,
        &VerifyArgs {
            key: VerifyKey::Raw(ecc.public_key.clone().unwrap_or_default()),
            scheme,
            input: b"boot image".to_vec(),
            signature,
            flags: VerifyFlags::INPUT_MESSAGE,
        },
    )?;
    println!("      verification {:?} ({:#010x})", status, status.value());

    println!("  [5] Lock group 1 in the cache, then commit group 2 until the counter runs out");
    hsm.manage_key_group(km, 1, KeyGroupFlags::CACHE_LOCKDOWN)?;
    for round in 0..3 {
        let mut update = GenerateKeyArgs::update(ecc.key_id, KeyType::EcdsaNistP256, 2, KeyInfo::empty());
        update.flags |= KeyGenFlags::STRICT_OPERATION;
        let outcome = hsm.generate_key(km, &update)?;
        println!("      update {}: {:?}", round + 1, outcome.status);
    }

    let info = hsm.get_info(session)?;
    println!(
        "  [6] Chip counter {}  key store counter {:?}  NVM writes {}",
        info.chip_monotonic_counter,
        info.key_store_counter,
        nvm.write_count()
    );
    let status = hsm.key_store_status(ks)?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    hsm.close_session(session)?;
    println!("\n  Open handles after close: {}", hsm.open_handles());
    Ok(())
}

async fn cmd_stress(args: &[String]) -> CmdResult {
    let stores: u32 = match args.first() {
        Some(_) => parse(args.first(), "stores")?,
        None => 8,
    };
    let keys: u32 = match args.get(1) {
        Some(_) => parse(args.get(1), "keys")?,
        None => 50,
    };
    let hsm = Arc::new(boot(Arc::new(InMemoryNvm::new()))?);
    let started = Instant::now();

    let mut tasks = Vec::new();
    for store in 0..stores {
        let hsm = hsm.clone();
        tasks.push(tokio::task::spawn_blocking(move || -> Result<u32, HsmError> {
            let session = hsm.open_session(SessionConfig::default())?;
            let ks = open_store(&hsm, session, 0x100 + store, store)?;
            let km = hsm.open_service(ks, FlowKind::KeyManagement)?;
            let mut gen = GenerateKeyArgs::create(KeyType::Aes128, 1, KeyInfo::empty());
            gen.flags |= KeyGenFlags::STRICT_OPERATION;
            for _ in 0..keys {
                hsm.generate_key(km, &gen)?;
            }
            let counter = hsm.key_store_status(ks)?.counter;
            hsm.close_session(session)?;
            Ok(u32::from(counter))
        }));
    }

    let mut commits = 0u32;
    for task in tasks {
        commits += task.await??;
    }
    let elapsed = started.elapsed();
    println!(
        "  {} stores x {} keys: {} commits in {:.1} ms (chip counter {})",
        stores,
        keys,
        commits,
        elapsed.as_secs_f64() * 1000.0,
        hsm.chip_counter()
    );
    Ok(())
}
