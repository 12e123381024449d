use age::secrecy::ExposeSecret as _;
use color_eyre::eyre::Result;
use langbird::encryption::EncryptionConfig;

/// Print a fresh age identity for encrypting the session store at rest
fn main() -> Result<()> {
    color_eyre::install()?;

    let config = EncryptionConfig::generate();
    let secret = config.key.to_string();

    println!("# public recipient: {}", config.key.to_public());
    println!("ENCRYPTION_KEY=\"{}\"", secret.expose_secret());

    Ok(())
}
