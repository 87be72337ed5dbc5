use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

pub const MIN_PASSWORD_LEN: usize = 8;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl Role {
    pub const ALL: &'static [Role] = &[Role::Admin, Role::Teacher, Role::Student];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("session expired or unknown")]
    SessionExpired,
    #[error("password must be at least 8 characters")]
    WeakPassword,
    #[error("stored role is not recognised: {0}")]
    CorruptRole(String),
    #[error("RNG failure: {0}")]
    Rng(String),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::SessionExpired => "session_expired",
            AuthError::WeakPassword => "bad_params",
            AuthError::CorruptRole(_) => "db_corrupt",
            AuthError::Rng(_) => "internal",
            AuthError::Db(_) => "db_query_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: Role,
    pub full_name: String,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user: User,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Granted,
    RedirectLogin,
    RedirectUnauthorized,
}

impl Access {
    pub fn as_str(self) -> &'static str {
        match self {
            Access::Granted => "granted",
            Access::RedirectLogin => "login",
            Access::RedirectUnauthorized => "unauthorized",
        }
    }

    pub fn redirect(self) -> Option<&'static str> {
        match self {
            Access::Granted => None,
            Access::RedirectLogin => Some("/login"),
            Access::RedirectUnauthorized => Some("/unauthorized"),
        }
    }
}

/// Login first, then role membership.
pub fn gate(session: Option<&Session>, allowed: &[Role]) -> Access {
    match session {
        None => Access::RedirectLogin,
        Some(s) if allowed.contains(&s.user.role) => Access::Granted,
        Some(_) => Access::RedirectUnauthorized,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteRule {
    Public,
    Roles(&'static [Role]),
}

const ROUTES: &[(&str, RouteRule)] = &[
    ("/login", RouteRule::Public),
    ("/unauthorized", RouteRule::Public),
    ("/admin", RouteRule::Roles(&[Role::Admin])),
    ("/teacher", RouteRule::Roles(&[Role::Teacher])),
    ("/student", RouteRule::Roles(&[Role::Student])),
    ("/chat", RouteRule::Roles(Role::ALL)),
    ("/reports", RouteRule::Roles(Role::ALL)),
    ("/profile", RouteRule::Roles(Role::ALL)),
];

/// Longest prefix wins; `/` alone is open to every signed-in role.
pub fn route_rule(path: &str) -> Option<RouteRule> {
    let path = path.trim();
    if path.is_empty() || !path.starts_with('/') {
        return None;
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Some(RouteRule::Roles(Role::ALL));
    }
    ROUTES
        .iter()
        .filter(|(prefix, _)| {
            trimmed == *prefix
                || trimmed
                    .strip_prefix(prefix)
                    .map(|rest| rest.starts_with('/'))
                    .unwrap_or(false)
        })
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, rule)| *rule)
}

pub fn check_route(session: Option<&Session>, rule: RouteRule) -> Access {
    match rule {
        RouteRule::Public => Access::Granted,
        RouteRule::Roles(roles) => gate(session, roles),
    }
}

/// PBKDF2-SHA256, hex-encoded.
pub fn hash_password(password: &str, salt: &[u8]) -> String {
    let mut hash = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut hash);
    hex::encode(hash)
}

fn new_salt() -> Result<[u8; SALT_LEN], AuthError> {
    let mut salt = [0u8; SALT_LEN];
    getrandom::getrandom(&mut salt).map_err(|e| AuthError::Rng(e.to_string()))?;
    Ok(salt)
}

fn verify_password(password: &str, hash_hex: &str, salt_hex: &str) -> bool {
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    digests_match(&hash_password(password, &salt), hash_hex)
}

fn digests_match(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

pub fn create_user(
    conn: &Connection,
    email: &str,
    password: &str,
    role: Role,
    full_name: &str,
) -> Result<User, AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword);
    }
    let id = Uuid::new_v4().to_string();
    let salt = new_salt()?;
    let email = normalize_email(email);
    conn.execute(
        "INSERT INTO users(id, email, password_hash, password_salt, role, full_name, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &email,
            hash_password(password, &salt),
            hex::encode(salt),
            role.as_str(),
            full_name.trim(),
            crate::db::now_rfc3339(),
        ),
    )?;
    Ok(User {
        id,
        email,
        role,
        full_name: full_name.trim().to_string(),
    })
}

fn user_from_row(id: String, email: String, role: String, full_name: String) -> Result<User, AuthError> {
    let parsed = Role::parse(&role).ok_or(AuthError::CorruptRole(role))?;
    Ok(User {
        id,
        email,
        role: parsed,
        full_name,
    })
}

pub fn load_user(conn: &Connection, user_id: &str) -> Result<Option<User>, AuthError> {
    let row = conn
        .query_row(
            "SELECT id, email, role, full_name FROM users WHERE id = ?",
            [user_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    row.map(|(id, email, role, name)| user_from_row(id, email, role, name))
        .transpose()
}

pub fn login(
    conn: &Connection,
    email: &str,
    password: &str,
    ttl_hours: i64,
) -> Result<Session, AuthError> {
    let row = conn
        .query_row(
            "SELECT id, email, role, full_name, password_hash, password_salt
             FROM users WHERE email = ?",
            [normalize_email(email)],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;
    let Some((id, email, role, full_name, stored_hash, salt)) = row else {
        return Err(AuthError::InvalidCredentials);
    };
    if !verify_password(password, &stored_hash, &salt) {
        return Err(AuthError::InvalidCredentials);
    }
    let user = user_from_row(id, email, role, full_name)?;

    let now = Utc::now();
    let expires_at = now + Duration::hours(ttl_hours);
    let token = Uuid::new_v4().simple().to_string();
    conn.execute(
        "INSERT INTO sessions(token, user_id, created_at, expires_at) VALUES(?, ?, ?, ?)",
        (&token, &user.id, now.to_rfc3339(), expires_at.to_rfc3339()),
    )?;
    Ok(Session {
        token,
        user,
        expires_at,
    })
}

pub fn restore(conn: &Connection, token: &str) -> Result<Session, AuthError> {
    let row = conn
        .query_row(
            "SELECT user_id, expires_at FROM sessions WHERE token = ?",
            [token],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )
        .optional()?;
    let Some((user_id, expires_raw)) = row else {
        return Err(AuthError::SessionExpired);
    };
    let expires_at = DateTime::parse_from_rfc3339(&expires_raw)
        .map(|d| d.with_timezone(&Utc))
        .ok();
    let live = expires_at.filter(|e| *e > Utc::now());
    let user = load_user(conn, &user_id)?;
    match (live, user) {
        (Some(expires_at), Some(user)) => Ok(Session {
            token: token.to_string(),
            user,
            expires_at,
        }),
        _ => {
            logout(conn, token)?;
            Err(AuthError::SessionExpired)
        }
    }
}

pub fn logout(conn: &Connection, token: &str) -> Result<(), AuthError> {
    conn.execute("DELETE FROM sessions WHERE token = ?", [token])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_for(role: Role) -> Session {
        Session {
            token: "t".into(),
            user: User {
                id: "u".into(),
                email: "u@example.org".into(),
                role,
                full_name: "U".into(),
            },
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn gate_requires_login_then_role() {
        assert_eq!(gate(None, &[Role::Admin]), Access::RedirectLogin);
        let teacher = session_for(Role::Teacher);
        assert_eq!(gate(Some(&teacher), &[Role::Admin]), Access::RedirectUnauthorized);
        assert_eq!(
            gate(Some(&teacher), &[Role::Admin, Role::Teacher]),
            Access::Granted
        );
    }

    #[test]
    fn route_rules_match_by_segment() {
        assert_eq!(route_rule("/admin/users"), Some(RouteRule::Roles(&[Role::Admin])));
        assert_eq!(route_rule("/administrator"), None);
        assert_eq!(route_rule("/login"), Some(RouteRule::Public));
        assert_eq!(route_rule("/"), Some(RouteRule::Roles(Role::ALL)));
        assert_eq!(route_rule("admin"), None);

        let student = session_for(Role::Student);
        let rule = route_rule("/teacher/attendance").expect("rule");
        assert_eq!(check_route(Some(&student), rule), Access::RedirectUnauthorized);
        assert_eq!(check_route(None, rule), Access::RedirectLogin);
        assert_eq!(check_route(None, RouteRule::Public), Access::Granted);
    }

    #[test]
    fn password_hash_depends_on_salt() {
        let a = hash_password("correct horse", b"salt-a");
        let b = hash_password("correct horse", b"salt-b");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(verify_password("correct horse", &a, &hex::encode(b"salt-a")));
        assert!(!verify_password("wrong horse", &a, &hex::encode(b"salt-a")));
        assert!(!verify_password("correct horse", &a, "not hex"));
    }

    #[test]
    fn login_and_restore_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = crate::db::open_db(dir.path()).expect("open db");
        create_user(&conn, "Ada@School.org", "password1", Role::Teacher, "Ada").expect("user");

        assert!(matches!(
            login(&conn, "ada@school.org", "wrong-pass", 1),
            Err(AuthError::InvalidCredentials)
        ));
        let session = login(&conn, "ada@school.org", "password1", 1).expect("login");
        assert_eq!(session.user.role, Role::Teacher);

        let restored = restore(&conn, &session.token).expect("restore");
        assert_eq!(restored.user.id, session.user.id);

        logout(&conn, &session.token).expect("logout");
        assert!(matches!(
            restore(&conn, &session.token),
            Err(AuthError::SessionExpired)
        ));
    }

    #[test]
    fn expired_sessions_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = crate::db::open_db(dir.path()).expect("open db");
        create_user(&conn, "s@school.org", "password1", Role::Student, "S").expect("user");
        let session = login(&conn, "s@school.org", "password1", -1).expect("login");
        assert!(matches!(
            restore(&conn, &session.token),
            Err(AuthError::SessionExpired)
        ));
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
            .expect("count");
        assert_eq!(left, 0);
    }
}
