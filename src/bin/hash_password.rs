//! Prints an argon2 hash for the `passwordHash` field of `users.json`.
//!
//! Usage: `hash_password <password>`

use stokvel_admin::auth::hash_password;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Some(password) = std::env::args().nth(1) else {
        eprintln!("usage: hash_password <password>");
        std::process::exit(2);
    };

    println!("{}", hash_password(&password)?);
    Ok(())
}
