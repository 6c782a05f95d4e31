//! Daemon and caller configuration.
//!
//! All configuration lives under `/etc/hasher-priv`, reached only through
//! validated directory walks, and uses a line-oriented `name = value`
//! grammar with `#` comments.  The caller configuration is layered:
//! `system`, then `user.d/<user>`, then optionally `user.d/<user>:<num>`
//! which discards the previous `user1`/`user2` choice.

use crate::{
    caller::Caller,
    chdir::{safe_chdir, Validator},
    error::{Error, Result},
    CONFIG_DIR, MAX_CONFIG_SIZE, MIN_CHANGE_GID, MIN_CHANGE_UID,
};
use nix::{
    fcntl::{open, OFlag},
    sys::stat::{fstat, Mode},
    unistd::{Gid, Group, Uid, User},
};
use std::os::unix::io::RawFd;

/// One known resource limit with its optional configured values.
#[derive(Debug, Clone)]
pub struct RlimitSpec {
    pub name: &'static str,
    pub resource: libc::c_int,
    pub hard: Option<libc::rlim_t>,
    pub soft: Option<libc::rlim_t>,
}

fn rlimit_table() -> Vec<RlimitSpec> {
    macro_rules! limit {
        ($name:expr, $resource:expr) => {
            RlimitSpec {
                name: $name,
                resource: $resource as libc::c_int,
                hard: None,
                soft: None,
            }
        };
    }
    vec![
        limit!("cpu", libc::RLIMIT_CPU),
        limit!("fsize", libc::RLIMIT_FSIZE),
        limit!("data", libc::RLIMIT_DATA),
        limit!("stack", libc::RLIMIT_STACK),
        limit!("core", libc::RLIMIT_CORE),
        limit!("rss", libc::RLIMIT_RSS),
        limit!("nproc", libc::RLIMIT_NPROC),
        limit!("nofile", libc::RLIMIT_NOFILE),
        limit!("memlock", libc::RLIMIT_MEMLOCK),
        limit!("as", libc::RLIMIT_AS),
        limit!("locks", libc::RLIMIT_LOCKS),
        limit!("sigpending", libc::RLIMIT_SIGPENDING),
        limit!("msgqueue", libc::RLIMIT_MSGQUEUE),
        limit!("nice", libc::RLIMIT_NICE),
        limit!("rtprio", libc::RLIMIT_RTPRIO),
    ]
}

/// Work limit counters; zero means "no limit".
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkLimits {
    pub time_elapsed: u64,
    pub time_idle: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// One of the two pre-configured identities inside the chroot.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
}

/// The merged caller configuration.
#[derive(Debug, Clone)]
pub struct CallerConfig {
    pub user1: Option<String>,
    pub user2: Option<String>,
    pub target1: Option<Target>,
    pub target2: Option<Target>,
    pub prefix_path: String,
    pub prefix_list: Vec<String>,
    pub umask: libc::mode_t,
    pub nice: i32,
    pub nproc: usize,
    pub allowed_devices: Vec<String>,
    pub allowed_mountpoints: Vec<String>,
    pub requested_mountpoints: Vec<String>,
    pub rlimits: Vec<RlimitSpec>,
    pub wlimits: WorkLimits,
    pub makedev_console: bool,
    pub use_pty: bool,
    pub term: Option<String>,
    pub x11_display: Option<String>,
    pub x11_key: Option<String>,
    pub share_ipc: Option<bool>,
    pub share_network: Option<bool>,
    pub share_uts: Option<bool>,
    /// Filled while the X11 display is parsed: TCP forwarding needs the
    /// caller's network namespace.
    pub share_caller_network: bool,
    pub config_file_name: String,
}

impl Default for CallerConfig {
    fn default() -> Self {
        CallerConfig {
            user1: None,
            user2: None,
            target1: None,
            target2: None,
            prefix_path: String::new(),
            prefix_list: Vec::new(),
            umask: 0o022,
            nice: 8,
            nproc: 0,
            allowed_devices: Vec::new(),
            allowed_mountpoints: Vec::new(),
            requested_mountpoints: Vec::new(),
            rlimits: rlimit_table(),
            wlimits: WorkLimits::default(),
            makedev_console: false,
            use_pty: false,
            term: None,
            x11_display: None,
            x11_key: None,
            share_ipc: None,
            share_network: None,
            share_uts: None,
            share_caller_network: false,
            config_file_name: String::new(),
        }
    }
}

fn bad_name(name: &str, fname: &str) -> Error {
    Error::config(format!("{}: unrecognized option: {}", fname, name))
}

fn bad_value(name: &str, value: &str, fname: &str) -> Error {
    Error::config(format!(
        "{}: invalid value for \"{}\" option: {}",
        fname, name, value
    ))
}

pub fn parse_ul(name: &str, value: &str, fname: &str) -> Result<u64> {
    if value.is_empty() {
        return Err(bad_value(name, value, fname));
    }
    value
        .parse::<u64>()
        .map_err(|_| bad_value(name, value, fname))
}

pub fn parse_bool(name: &str, value: &str, fname: &str) -> Result<bool> {
    if value.is_empty()
        || value.eq_ignore_ascii_case("no")
        || value.eq_ignore_ascii_case("false")
        || value == "0"
    {
        return Ok(false);
    }
    if value.eq_ignore_ascii_case("yes") || value.eq_ignore_ascii_case("true") || value == "1" {
        return Ok(true);
    }
    Err(bad_value(name, value, fname))
}

pub fn parse_umask(name: &str, value: &str, fname: &str) -> Result<libc::mode_t> {
    if value.is_empty() {
        return Err(bad_value(name, value, fname));
    }
    match libc::mode_t::from_str_radix(value, 8) {
        Ok(n) if n <= 0o777 => Ok(n),
        _ => Err(bad_value(name, value, fname)),
    }
}

pub fn parse_nice(name: &str, value: &str, fname: &str) -> Result<i32> {
    if value.is_empty() {
        return Err(bad_value(name, value, fname));
    }
    match value.parse::<u32>() {
        Ok(n) if n <= 19 => Ok(n as i32),
        _ => Err(bad_value(name, value, fname)),
    }
}

pub fn parse_rlim(name: &str, value: &str, fname: &str) -> Result<libc::rlim_t> {
    if value.is_empty() {
        return Err(bad_value(name, value, fname));
    }
    if value.eq_ignore_ascii_case("inf") {
        return Ok(libc::RLIM_INFINITY);
    }
    value
        .parse::<libc::rlim_t>()
        .map_err(|_| bad_value(name, value, fname))
}

/// Split a whitespace/comma separated list, sorted with duplicates
/// removed.
pub fn parse_str_list(value: &str) -> Vec<String> {
    let mut items: Vec<String> = value
        .split(|c: char| c.is_ascii_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    items.sort();
    items.dedup();
    items
}

fn parse_prefix(name: &str, value: &str, fname: &str, home: &str) -> Result<String> {
    let mut prefix = if value == "~" {
        home.to_string()
    } else {
        value.to_string()
    };
    while prefix.ends_with('/') {
        prefix.pop();
    }
    if prefix.is_empty() || prefix.starts_with('/') {
        Ok(prefix)
    } else {
        Err(bad_value(name, value, fname))
    }
}

/// Parse a colon-separated prefix list; `~` stands for the caller's home.
pub fn parse_prefix_list(name: &str, value: &str, fname: &str, home: &str) -> Result<Vec<String>> {
    value
        .split(':')
        .filter(|p| !p.is_empty())
        .map(|p| parse_prefix(name, p, fname, home))
        .collect()
}

/// Tighten-only merge of a work limit.
///
/// A config file may set any value; later layers and the environment can
/// only lower an existing nonzero limit or set a zero one.
pub fn modify_wlim(current: &mut u64, value: u64, is_system: bool) {
    if is_system || *current == 0 || (value > 0 && value < *current) {
        *current = value;
    }
}

/// Parse `name = value` lines with `#` comments and whitespace trimming.
pub fn parse_name_values(content: &str, fname: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let eq = line.find('=').ok_or_else(|| {
            Error::config(format!("{}: syntax error at line {}", fname, idx + 1))
        })?;
        let name = line[..eq].trim_end();
        if name.is_empty() {
            return Err(Error::config(format!(
                "{}: syntax error at line {}",
                fname,
                idx + 1
            )));
        }
        let value = line[eq + 1..].trim();
        out.push((name.to_string(), value.to_string()));
    }
    Ok(out)
}

/// Open a config file by name relative to the current directory and read
/// it, enforcing ownership, type and size.
pub fn load_config_file(fname: &str) -> Result<String> {
    let fd = open(fname, OFlag::O_RDONLY | OFlag::O_NOFOLLOW | OFlag::O_NOCTTY, Mode::empty())
        .map_err(|err| Error::os(format!("open: {}", fname), err))?;
    let result = read_config_fd(fd, fname);
    let _ = nix::unistd::close(fd);
    result
}

fn read_config_fd(fd: RawFd, fname: &str) -> Result<String> {
    let st = fstat(fd).map_err(|err| Error::os(format!("fstat: {}", fname), err))?;

    if st.st_uid != 0 || st.st_mode & (libc::S_IWGRP | libc::S_IWOTH) != 0 {
        return Err(Error::config(format!(
            "{}: bad owner or permissions",
            fname
        )));
    }
    if st.st_mode & libc::S_IFMT != libc::S_IFREG {
        return Err(Error::config(format!("{}: not a regular file", fname)));
    }
    if st.st_size as u64 > MAX_CONFIG_SIZE {
        return Err(Error::config(format!(
            "{}: file too large: {}",
            fname, st.st_size
        )));
    }

    let mut buf = Vec::with_capacity(st.st_size as usize);
    let mut chunk = [0u8; 4096];
    loop {
        match nix::unistd::read(fd, &mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(nix::Error::EINTR) => continue,
            Err(err) => return Err(Error::os(format!("read: {}", fname), err)),
        }
    }
    String::from_utf8(buf).map_err(|_| Error::config(format!("{}: invalid encoding", fname)))
}

impl CallerConfig {
    /// Apply one `name = value` option from a config file.
    pub fn set_option(&mut self, name: &str, value: &str, fname: &str, home: &str) -> Result<()> {
        if name.eq_ignore_ascii_case("user1") {
            self.user1 = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("user2") {
            self.user2 = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("prefix") {
            self.prefix_list = parse_prefix_list(name, value, fname, home)?;
            self.prefix_path = value.to_string();
        } else if name.eq_ignore_ascii_case("umask") {
            self.umask = parse_umask(name, value, fname)?;
        } else if name.eq_ignore_ascii_case("nice") {
            self.nice = parse_nice(name, value, fname)?;
        } else if name.eq_ignore_ascii_case("nproc") {
            self.nproc = parse_ul(name, value, fname)? as usize;
        } else if name.eq_ignore_ascii_case("allowed_devices") {
            self.allowed_devices = parse_str_list(value);
        } else if name.eq_ignore_ascii_case("allowed_mountpoints") {
            self.allowed_mountpoints = parse_str_list(value);
        } else if name.eq_ignore_ascii_case("allow_ttydev") {
            // Obsolete; validated and ignored so old configs keep loading.
            let _ = parse_bool(name, value, fname)?;
        } else if let Some(rest) = strip_prefix_ignore_case(name, "rlimit_") {
            self.set_rlimit(rest, value, name, fname)?;
        } else if let Some(rest) = strip_prefix_ignore_case(name, "wlimit_") {
            self.set_wlimit(rest, value, name, fname, true)?;
        } else {
            return Err(bad_name(name, fname));
        }
        Ok(())
    }

    fn set_rlimit(&mut self, rest: &str, value: &str, optname: &str, fname: &str) -> Result<()> {
        let (hard, limit_name) = if let Some(n) = strip_prefix_ignore_case(rest, "hard_") {
            (true, n)
        } else if let Some(n) = strip_prefix_ignore_case(rest, "soft_") {
            (false, n)
        } else {
            return Err(bad_name(optname, fname));
        };

        let parsed = parse_rlim(optname, value, fname)?;
        for spec in &mut self.rlimits {
            if spec.name.eq_ignore_ascii_case(limit_name) {
                if hard {
                    spec.hard = Some(parsed);
                } else {
                    spec.soft = Some(parsed);
                }
                return Ok(());
            }
        }
        Err(bad_name(optname, fname))
    }

    fn set_wlimit(
        &mut self,
        rest: &str,
        value: &str,
        optname: &str,
        fname: &str,
        is_system: bool,
    ) -> Result<()> {
        let parsed = parse_ul(optname, value, fname)?;
        let current = if rest.eq_ignore_ascii_case("time_elapsed") {
            &mut self.wlimits.time_elapsed
        } else if rest.eq_ignore_ascii_case("time_idle") {
            &mut self.wlimits.time_idle
        } else if rest.eq_ignore_ascii_case("bytes_written") {
            &mut self.wlimits.bytes_written
        } else {
            return Err(bad_name(optname, fname));
        };
        modify_wlim(current, parsed, is_system);
        Ok(())
    }

    /// Apply the environment override allow-list from the job environment.
    ///
    /// Everything else in the environment is opaque to the daemon and
    /// reaches the child untouched only via the fixed in-chroot set.
    pub fn apply_environment(&mut self, env: &[(String, String)]) -> Result<()> {
        const F: &str = "environment";
        for (name, value) in env {
            match name.as_str() {
                "wlimit_time_elapsed" | "wlimit_time_idle" | "wlimit_bytes_written" => {
                    if !value.is_empty() {
                        self.set_wlimit(&name["wlimit_".len()..], value, name, F, false)?;
                    }
                }
                "makedev_console" => {
                    self.makedev_console = parse_bool(name, value, F)?;
                }
                "use_pty" => {
                    self.use_pty = parse_bool(name, value, F)?;
                }
                "TERM" => {
                    if !value.is_empty() {
                        self.term = Some(value.clone());
                    }
                }
                "XAUTH_DISPLAY" => {
                    if !value.is_empty() {
                        self.x11_display = Some(value.clone());
                    }
                }
                "XAUTH_KEY" => {
                    if !value.is_empty() {
                        self.x11_key = Some(value.clone());
                    }
                }
                "share_ipc" => {
                    self.share_ipc = Some(parse_bool(name, value, F)?);
                }
                "share_network" => {
                    self.share_network = Some(parse_bool(name, value, F)?);
                }
                "share_uts" => {
                    self.share_uts = Some(parse_bool(name, value, F)?);
                }
                "requested_mountpoints" => {
                    self.requested_mountpoints = parse_str_list(value);
                }
                _ => {}
            }
        }
        // TERM only matters under a pty.
        if !self.use_pty {
            self.term = None;
        }
        Ok(())
    }

    fn load_file(&mut self, fname: &str, home: &str) -> Result<()> {
        let content = load_config_file(fname)?;
        for (name, value) in parse_name_values(&content, fname)? {
            self.set_option(&name, &value, fname, home)?;
        }
        self.config_file_name = fname.to_string();
        Ok(())
    }
}

fn strip_prefix_ignore_case<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    if name.len() >= prefix.len() && name[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&name[prefix.len()..])
    } else {
        None
    }
}

/// Resolve and validate a target user against the §3 pair invariants.
fn check_user(user_name: Option<&str>, which: &str, caller: &Caller) -> Result<Target> {
    let user_name = match user_name {
        Some(name) if !name.is_empty() => name,
        _ => return Err(Error::config(format!("undefined: {}", which))),
    };

    let pw = User::from_name(user_name)
        .map_err(|err| Error::os(format!("{}: {} lookup", which, user_name), err))?
        .ok_or_else(|| Error::config(format!("{}: {} lookup failure", which, user_name)))?;

    if pw.name != user_name {
        return Err(Error::config(format!(
            "{}: {}: name mismatch",
            which, user_name
        )));
    }
    if pw.uid.as_raw() < MIN_CHANGE_UID {
        return Err(Error::config(format!(
            "{}: {}: invalid uid: {}",
            which, user_name, pw.uid
        )));
    }
    if pw.gid.as_raw() < MIN_CHANGE_GID {
        return Err(Error::config(format!(
            "{}: {}: invalid gid: {}",
            which, user_name, pw.gid
        )));
    }
    if caller.user == user_name {
        return Err(Error::config(format!(
            "{}: {}: name coincides with caller",
            which, user_name
        )));
    }
    if caller.uid == pw.uid {
        return Err(Error::config(format!(
            "{}: {}: uid coincides with caller",
            which, user_name
        )));
    }
    if caller.gid == pw.gid {
        return Err(Error::config(format!(
            "{}: {}: gid coincides with caller",
            which, user_name
        )));
    }

    Ok(Target {
        name: pw.name,
        uid: pw.uid,
        gid: pw.gid,
    })
}

/// Load the layered caller configuration and resolve both target users.
pub fn configure_caller(caller: &Caller) -> Result<CallerConfig> {
    let home = caller.home.to_string_lossy().into_owned();

    safe_chdir("/", Validator::RootOk)?;
    safe_chdir("etc/hasher-priv", Validator::RootOk)?;

    let mut cfg = CallerConfig::default();
    cfg.load_file("system", &home)?;

    safe_chdir("user.d", Validator::RootOk)?;
    cfg.load_file(&caller.user, &home)?;

    if caller.num != 0 {
        // Discard user1 and user2: a subconfig must pick its own pair.
        cfg.user1 = None;
        cfg.user2 = None;
        let fname = format!("{}:{}", caller.user, caller.num);
        cfg.load_file(&fname, &home)?;
    }

    safe_chdir("/", Validator::RootOk)?;

    let target1 = check_user(cfg.user1.as_deref(), "user1", caller)?;
    let target2 = check_user(cfg.user2.as_deref(), "user2", caller)?;

    if target1.name == target2.name {
        return Err(Error::config("user1 coincides with user2"));
    }
    if target1.uid == target2.uid {
        return Err(Error::config("uid of user1 coincides with uid of user2"));
    }
    if target1.gid == target2.gid {
        return Err(Error::config("gid of user1 coincides with gid of user2"));
    }

    cfg.target1 = Some(target1);
    cfg.target2 = Some(target2);
    Ok(cfg)
}

/// The daemon's own configuration from `daemon.conf`.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub access_group: String,
    pub access_gid: Gid,
    pub session_timeout: u64,
    pub pidfile: Option<String>,
    pub loglevel: Option<String>,
    pub min_uid: libc::uid_t,
    pub min_gid: libc::gid_t,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            access_group: String::new(),
            access_gid: Gid::from_raw(0),
            session_timeout: 3600,
            pidfile: None,
            loglevel: None,
            min_uid: MIN_CHANGE_UID,
            min_gid: MIN_CHANGE_GID,
        }
    }
}

impl DaemonConfig {
    /// Apply one option from `daemon.conf`.
    pub fn set_option(&mut self, name: &str, value: &str, fname: &str) -> Result<()> {
        if name.eq_ignore_ascii_case("session_timeout") {
            self.session_timeout = parse_ul(name, value, fname)?;
        } else if name.eq_ignore_ascii_case("loglevel") {
            self.loglevel = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("pidfile") {
            self.pidfile = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("access_group") {
            self.access_group = value.to_string();
        } else if name.eq_ignore_ascii_case("min_uid") {
            self.min_uid = parse_ul(name, value, fname)? as libc::uid_t;
        } else if name.eq_ignore_ascii_case("min_gid") {
            self.min_gid = parse_ul(name, value, fname)? as libc::gid_t;
        } else {
            return Err(bad_name(name, fname));
        }
        Ok(())
    }

    fn resolve_access_gid(&mut self) -> Result<()> {
        if self.access_group.is_empty() {
            return Err(Error::config("undefined option: access_group"));
        }
        let group = Group::from_name(&self.access_group)
            .map_err(|err| Error::os("access_group lookup", err))?
            .ok_or_else(|| {
                Error::config(format!("access_group: {} lookup failure", self.access_group))
            })?;
        self.access_gid = group.gid;
        Ok(())
    }

    /// Load `/etc/hasher-priv/daemon.conf` through validated walks.
    pub fn load() -> Result<Self> {
        safe_chdir("/", Validator::RootOk)?;
        safe_chdir("etc/hasher-priv", Validator::RootOk)?;

        let fname = "daemon.conf";
        let content = load_config_file(fname)?;
        let mut cfg = DaemonConfig::default();
        for (name, value) in parse_name_values(&content, fname)? {
            cfg.set_option(&name, &value, fname)?;
        }

        safe_chdir("/", Validator::RootOk)?;

        cfg.resolve_access_gid()?;
        Ok(cfg)
    }

    /// The caller config path announced by `getconf`.
    pub fn caller_config_path(user: &str, num: u32) -> String {
        if num != 0 {
            format!("{}/user.d/{}:{}", CONFIG_DIR, user, num)
        } else {
            format!("{}/user.d/{}", CONFIG_DIR, user)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CallerConfig {
        CallerConfig::default()
    }

    #[test]
    fn test_name_value_grammar() {
        let parsed = parse_name_values(
            "# comment\n\n  user1 = alpha  \nnice=5\numask = 022\n",
            "system",
        )
        .unwrap();
        assert_eq!(
            parsed,
            vec![
                ("user1".to_string(), "alpha".to_string()),
                ("nice".to_string(), "5".to_string()),
                ("umask".to_string(), "022".to_string()),
            ]
        );
        assert!(parse_name_values("no equals sign", "system").is_err());
        assert!(parse_name_values("= value", "system").is_err());
    }

    #[test]
    fn test_umask_and_nice_bounds() {
        assert_eq!(parse_umask("umask", "777", "f").unwrap(), 0o777);
        assert_eq!(parse_umask("umask", "022", "f").unwrap(), 0o022);
        assert!(parse_umask("umask", "1777", "f").is_err());
        assert!(parse_umask("umask", "", "f").is_err());
        assert!(parse_umask("umask", "8", "f").is_err());

        assert_eq!(parse_nice("nice", "19", "f").unwrap(), 19);
        assert!(parse_nice("nice", "20", "f").is_err());
        assert!(parse_nice("nice", "-1", "f").is_err());
    }

    #[test]
    fn test_rlim_values() {
        assert_eq!(parse_rlim("l", "INF", "f").unwrap(), libc::RLIM_INFINITY);
        assert_eq!(parse_rlim("l", "1024", "f").unwrap(), 1024);
        assert!(parse_rlim("l", "12x", "f").is_err());
    }

    #[test]
    fn test_str_list_sorted_unique() {
        assert_eq!(
            parse_str_list("/dev/kvm, /dev/fuse\t/dev/kvm /proc"),
            vec!["/dev/fuse", "/dev/kvm", "/proc"]
        );
        assert!(parse_str_list("").is_empty());
    }

    #[test]
    fn test_prefix_list() {
        let list = parse_prefix_list("prefix", "~:/srv//", "f", "/home/alice").unwrap();
        assert_eq!(list, vec!["/home/alice", "/srv"]);
        // A lone "/" collapses to the empty prefix, meaning "any".
        let list = parse_prefix_list("prefix", "/", "f", "/home/alice").unwrap();
        assert_eq!(list, vec![""]);
        assert!(parse_prefix_list("prefix", "relative/path", "f", "/h").is_err());
    }

    #[test]
    fn test_wlim_tighten_only() {
        let mut v = 0u64;
        modify_wlim(&mut v, 100, false);
        assert_eq!(v, 100);
        // The environment cannot loosen an existing limit.
        modify_wlim(&mut v, 200, false);
        assert_eq!(v, 100);
        modify_wlim(&mut v, 50, false);
        assert_eq!(v, 50);
        // A config file can.
        modify_wlim(&mut v, 500, true);
        assert_eq!(v, 500);
    }

    #[test]
    fn test_rlimit_options() {
        let mut c = cfg();
        c.set_option("rlimit_hard_nofile", "1024", "f", "/h").unwrap();
        c.set_option("RLIMIT_SOFT_NOFILE", "256", "f", "/h").unwrap();
        c.set_option("rlimit_soft_as", "inf", "f", "/h").unwrap();
        let nofile = c.rlimits.iter().find(|s| s.name == "nofile").unwrap();
        assert_eq!(nofile.hard, Some(1024));
        assert_eq!(nofile.soft, Some(256));
        let address_space = c.rlimits.iter().find(|s| s.name == "as").unwrap();
        assert_eq!(address_space.soft, Some(libc::RLIM_INFINITY));

        assert!(c.set_option("rlimit_hard_bogus", "1", "f", "/h").is_err());
        assert!(c.set_option("rlimit_nofile", "1", "f", "/h").is_err());
    }

    #[test]
    fn test_obsolete_and_unknown_options() {
        let mut c = cfg();
        // Accepted and ignored.
        c.set_option("allow_ttydev", "yes", "f", "/h").unwrap();
        assert!(c.set_option("allow_ttydev", "maybe", "f", "/h").is_err());
        assert!(c.set_option("no_such_option", "1", "f", "/h").is_err());
    }

    #[test]
    fn test_environment_allow_list() {
        let mut c = cfg();
        c.set_option("wlimit_time_elapsed", "100", "f", "/h").unwrap();

        let env = vec![
            ("wlimit_time_elapsed".to_string(), "50".to_string()),
            ("use_pty".to_string(), "yes".to_string()),
            ("TERM".to_string(), "xterm".to_string()),
            ("share_network".to_string(), "no".to_string()),
            ("requested_mountpoints".to_string(), "/proc,/dev/pts".to_string()),
            ("HOME".to_string(), "/ignored".to_string()),
        ];
        c.apply_environment(&env).unwrap();

        assert_eq!(c.wlimits.time_elapsed, 50);
        assert!(c.use_pty);
        assert_eq!(c.term.as_deref(), Some("xterm"));
        assert_eq!(c.share_network, Some(false));
        assert_eq!(c.requested_mountpoints, vec!["/dev/pts", "/proc"]);

        // Loosening attempts are ignored.
        let env = vec![("wlimit_time_elapsed".to_string(), "500".to_string())];
        c.apply_environment(&env).unwrap();
        assert_eq!(c.wlimits.time_elapsed, 50);
    }

    #[test]
    fn test_term_dropped_without_pty() {
        let mut c = cfg();
        let env = vec![("TERM".to_string(), "xterm".to_string())];
        c.apply_environment(&env).unwrap();
        assert_eq!(c.term, None);
    }

    #[test]
    fn test_caller_config_path() {
        assert_eq!(
            DaemonConfig::caller_config_path("alice", 0),
            "/etc/hasher-priv/user.d/alice"
        );
        assert_eq!(
            DaemonConfig::caller_config_path("alice", 3),
            "/etc/hasher-priv/user.d/alice:3"
        );
    }

    #[test]
    fn test_daemon_config_options() {
        let mut d = DaemonConfig::default();
        d.set_option("access_group", "hashman", "daemon.conf").unwrap();
        d.set_option("session_timeout", "900", "daemon.conf").unwrap();
        d.set_option("loglevel", "info", "daemon.conf").unwrap();
        d.set_option("pidfile", "/run/hasher-privd.pid", "daemon.conf").unwrap();
        assert_eq!(d.access_group, "hashman");
        assert_eq!(d.session_timeout, 900);
        assert!(d.set_option("bogus", "1", "daemon.conf").is_err());
    }
}
