pub mod bip;
pub mod capture;
pub mod ccmp;
pub mod cipher;
pub mod config;
pub mod devices;
pub mod eapol;
pub mod engine;
pub mod frame;
pub mod gcmp;
pub mod ie;
pub mod kdf;
pub mod pn;
pub mod processing;
pub mod runtime;
pub mod status;
pub mod tdls;
pub mod tkip;
pub mod tx;
pub mod util;
pub mod wep;
