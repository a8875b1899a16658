mod auth_reject_invalid_credentials;
mod common;
mod config_invalid_secret_key_path;
mod ssh_client_disconnect_closes_backend;
mod ssh_env_before_subsystem;
