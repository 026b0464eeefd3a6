//! `PG*` environment variables.

use super::Settings;

const VARIABLES: &[(&str, &str)] = &[
    ("PGHOST", "host"),
    ("PGPORT", "port"),
    ("PGDATABASE", "dbname"),
    ("PGUSER", "user"),
    ("PGPASSWORD", "password"),
    ("PGPASSFILE", "passfile"),
    ("PGAPPNAME", "application_name"),
    ("PGCONNECT_TIMEOUT", "connect_timeout"),
    ("PGSSLMODE", "sslmode"),
    ("PGSSLKEY", "sslkey"),
    ("PGSSLCERT", "sslcert"),
    ("PGSSLROOTCERT", "sslrootcert"),
    ("PGTARGETSESSIONATTRS", "target_session_attrs"),
    ("PGSERVICE", "service"),
    ("PGSERVICEFILE", "servicefile"),
    ("PGSSLSNI", "sslsni"),
    ("PGOPTIONS", "options"),
];

/// Settings taken from the environment. Empty variables are ignored.
pub(crate) fn settings(env: &dyn Fn(&str) -> Option<String>) -> Settings {
    VARIABLES
        .iter()
        .filter_map(|(var, key)| {
            env(var)
                .filter(|v| !v.is_empty())
                .map(|v| ((*key).to_string(), v))
        })
        .collect()
}
