///
/// Output filename templating
///
/// Expands `%` tokens in a filename pattern with facts about the running
/// process and host:
///
/// | token | expands to                         |
/// |-------|------------------------------------|
/// | `%%`  | a literal `%`                      |
/// | `%p`  | process id                         |
/// | `%d`  | home directory                     |
/// | `%i`  | user id                            |
/// | `%L`  | host name                          |
/// | `%l`  | host name followed by domain name  |
/// | `%u`  | user name                          |
///
/// Any other character after `%` is kept as is and a trailing `%` is
/// dropped. Facts the host cannot provide expand to nothing.
///

use std::ffi::{c_char, CStr, CString};
use std::path::PathBuf;

use crate::errors::InteropError;
use crate::exception::set_last_error;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilenameContext {
    pub pid: u32,
    pub home_dir: Option<PathBuf>,
    pub uid: Option<u32>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub domain: Option<String>,
}

impl FilenameContext {
    /// Gather the facts for the current process. On unix the user name
    /// and home directory come from the account database entry for the
    /// real uid, so `USER` and `HOME` do not affect them.
    pub fn current() -> Self {
        let (user, home_dir) = account();
        Self {
            pid: std::process::id(),
            home_dir,
            uid: current_uid(),
            user,
            hostname: hostname(),
            domain: domain_name(),
        }
    }

    pub fn format(&self, pattern: &str) -> String {
        let mut out = String::with_capacity(pattern.len());
        let mut chars = pattern.chars();

        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            let Some(token) = chars.next() else {
                break;
            };
            match token {
                'p' => out.push_str(&self.pid.to_string()),
                'd' => {
                    if let Some(home) = &self.home_dir {
                        out.push_str(&home.to_string_lossy());
                    }
                }
                'i' => {
                    if let Some(uid) = self.uid {
                        out.push_str(&uid.to_string());
                    }
                }
                'L' | 'l' => {
                    if let Some(host) = &self.hostname {
                        out.push_str(host);
                    }
                    if token == 'l' {
                        if let Some(domain) = &self.domain {
                            out.push_str(domain);
                        }
                    }
                }
                'u' => {
                    if let Some(user) = &self.user {
                        out.push_str(user);
                    }
                }
                other => out.push(other),
            }
        }

        out
    }
}

/// Expand `pattern` for the current process.
pub fn format_filename(pattern: &str) -> String {
    FilenameContext::current().format(pattern)
}

/// Expand a NUL-terminated pattern. The result must be released with
/// `ccall_string_free`. Returns null and sets the last error if the
/// pattern is not UTF-8 or the result contains a NUL byte.
///
/// # Safety
/// `pattern` must be a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ccall_format_filename(pattern: *const c_char) -> *mut c_char {
    if pattern.is_null() {
        set_last_error(InteropError::InvalidName("null filename pattern".to_string()));
        return std::ptr::null_mut();
    }
    let pattern = match unsafe { CStr::from_ptr(pattern) }.to_str() {
        Ok(p) => p,
        Err(e) => {
            set_last_error(InteropError::InvalidName(format!("filename pattern: {}", e)));
            return std::ptr::null_mut();
        }
    };
    match CString::new(format_filename(pattern)) {
        Ok(s) => s.into_raw(),
        Err(e) => {
            set_last_error(InteropError::InvalidName(format!("expanded filename: {}", e)));
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `s` must come from `ccall_format_filename` and not be freed twice.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ccall_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(unsafe { CString::from_raw(s) });
    }
}

#[cfg(unix)]
fn current_uid() -> Option<u32> {
    Some(unsafe { libc::getuid() })
}

#[cfg(not(unix))]
fn current_uid() -> Option<u32> {
    None
}

/// User name and home directory from the passwd entry of the real uid.
#[cfg(unix)]
fn account() -> (Option<String>, Option<PathBuf>) {
    let mut entry: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf: Vec<c_char> = vec![0; 1024];

    loop {
        let rc = unsafe { libc::getpwuid_r(libc::getuid(), &mut entry, buf.as_mut_ptr(), buf.len(), &mut result) };
        if rc == libc::ERANGE && buf.len() < 1 << 20 {
            let len = buf.len() * 2;
            buf.resize(len, 0);
            continue;
        }
        break;
    }
    if result.is_null() {
        return (None, None);
    }

    let user = unsafe { c_field(entry.pw_name) };
    let home = unsafe { c_field(entry.pw_dir) }.map(PathBuf::from);
    (user, home)
}

/// # Safety
/// `field` must be null or point to a NUL-terminated string.
#[cfg(unix)]
unsafe fn c_field(field: *const c_char) -> Option<String> {
    if field.is_null() {
        return None;
    }
    let value = unsafe { CStr::from_ptr(field) }.to_string_lossy().into_owned();
    (!value.is_empty()).then_some(value)
}

#[cfg(not(unix))]
fn account() -> (Option<String>, Option<PathBuf>) {
    let user = ["USERNAME", "USER"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()));
    (user, dirs::home_dir())
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    c_buffer_to_string(&buf)
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn domain_name() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::getdomainname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    c_buffer_to_string(&buf)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn domain_name() -> Option<String> {
    None
}

#[cfg(unix)]
fn c_buffer_to_string(buf: &[u8]) -> Option<String> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&buf[..end]).into_owned())
}
