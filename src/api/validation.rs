//! Input validation for the sale form.
//!
//! Validators return the normalized value on success so handlers can feed a
//! [`ValidationErrorBuilder`](super::error::ValidationErrorBuilder) and build
//! the sale request in one pass.

use chrono::{Datelike, NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use crate::catalog::digits_only;

lazy_static! {
    /// Birth date as typed at the counter: DD/MM/YYYY
    static ref BIRTH_DATE_REGEX: Regex = Regex::new(r"^(\d{2})/(\d{2})/(\d{4})$").unwrap();

    static ref EMAIL_REGEX: Regex = Regex::new(
        r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}$"
    ).unwrap();
}

pub const CPF_DIGITS: usize = 11;
pub const MAX_QUANTITY: u32 = 100;
const MIN_BIRTH_YEAR: i32 = 1900;

/// Validate a CPF and return its digits. Masked input (`123.456.789-01`) is accepted.
pub fn validate_cpf(cpf: &str) -> Result<String, String> {
    let digits = digits_only(cpf);
    if digits.len() != CPF_DIGITS {
        return Err("Invalid CPF".to_string());
    }
    Ok(digits)
}

/// Validate a DD/MM/YYYY birth date and return it as YYYY-MM-DD.
pub fn validate_birth_date(date: &str) -> Result<String, String> {
    let invalid = || "Invalid birth date. Use the DD/MM/YYYY format".to_string();

    let caps = BIRTH_DATE_REGEX.captures(date.trim()).ok_or_else(invalid)?;
    let day: u32 = caps[1].parse().map_err(|_| invalid())?;
    let month: u32 = caps[2].parse().map_err(|_| invalid())?;
    let year: i32 = caps[3].parse().map_err(|_| invalid())?;

    let parsed = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)?;
    if year < MIN_BIRTH_YEAR || year > Utc::now().year() {
        return Err(invalid());
    }
    Ok(parsed.format("%Y-%m-%d").to_string())
}

/// Validate a Brazilian phone number and return its digits (10 or 11 with area code).
pub fn validate_phone(phone: &str) -> Result<String, String> {
    let digits = digits_only(phone);
    if digits.is_empty() {
        return Err("Phone is required".to_string());
    }
    if !(10..=11).contains(&digits.len()) {
        return Err("Phone must have 10 or 11 digits including area code".to_string());
    }
    Ok(digits)
}

pub fn validate_email(email: &str) -> Result<String, String> {
    let email = email.trim();
    if email.len() > 254 {
        return Err("Email is too long (max 254 characters)".to_string());
    }
    if !EMAIL_REGEX.is_match(email) {
        return Err("Invalid email format".to_string());
    }
    Ok(email.to_string())
}

pub fn validate_name(name: &str) -> Result<String, String> {
    let name = name.trim();
    if name.is_empty() {
        return Err("Name is required".to_string());
    }
    if name.chars().count() > 200 {
        return Err("Name is too long (max 200 characters)".to_string());
    }
    Ok(name.to_string())
}

pub fn validate_quantity(quantity: u32) -> Result<u32, String> {
    if quantity == 0 {
        return Err("Quantity must be at least 1".to_string());
    }
    if quantity > MAX_QUANTITY {
        return Err(format!("Quantity must be at most {}", MAX_QUANTITY));
    }
    Ok(quantity)
}

/// Terminal ids are v4 UUIDs minted by this server.
pub fn validate_terminal_id(id: &str) -> Result<(), String> {
    uuid::Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| "Invalid terminal id".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_cpf() {
        assert_eq!(validate_cpf("123.456.789-01").unwrap(), "12345678901");
        assert_eq!(validate_cpf("12345678901").unwrap(), "12345678901");
        assert!(validate_cpf("1234567890").is_err());
        assert!(validate_cpf("").is_err());
    }

    #[test]
    fn test_validate_birth_date() {
        assert_eq!(validate_birth_date("02/01/1990").unwrap(), "1990-01-02");
        assert_eq!(validate_birth_date("29/02/2000").unwrap(), "2000-02-29");
        assert!(validate_birth_date("29/02/2001").is_err());
        assert!(validate_birth_date("31/12/1899").is_err());
        assert!(validate_birth_date("1990-01-02").is_err());
        assert!(validate_birth_date("2/1/1990").is_err());

        let next_year = Utc::now().year() + 1;
        assert!(validate_birth_date(&format!("01/01/{}", next_year)).is_err());
    }

    #[test]
    fn test_validate_phone() {
        assert_eq!(validate_phone("(11) 99999-9999").unwrap(), "11999999999");
        assert_eq!(validate_phone("1133334444").unwrap(), "1133334444");
        assert!(validate_phone("99999").is_err());
        assert!(validate_phone("").is_err());
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("ana@example.com").is_ok());
        assert!(validate_email(" ana.souza+pdv@mail.example.com.br ").is_ok());
        assert!(validate_email("ana@").is_err());
        assert!(validate_email("not-an-email").is_err());
    }

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(MAX_QUANTITY + 1).is_err());
    }

    #[test]
    fn test_validate_terminal_id() {
        assert!(validate_terminal_id(&uuid::Uuid::new_v4().to_string()).is_ok());
        assert!(validate_terminal_id("terminal-a").is_err());
    }
}
