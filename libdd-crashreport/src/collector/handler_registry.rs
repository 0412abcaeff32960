// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Installs the crash handlers, remembers what they replaced, and answers whether they are still
//! the ones the process would run on a crash.

use super::crash_handler::{
    handle_posix_sigaction, handle_termination_sigaction, live_panic_hook, PanicMessageHook,
};
use crate::shared::configuration::CrashReportingConfiguration;
use crate::shared::signals::signal_from_signum;
use libc::{
    c_void, mmap, sigaltstack, siginfo_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ,
    PROT_WRITE, SIGSTKSZ,
};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::CStr;
use std::panic::{self, PanicHookInfo};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};
use std::sync::Arc;

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
const MAX_SIGNALS: usize = 65;

// The handlers we replaced, read by `chain_signal_handler`.  Entries are `Box::into_raw` or null
// and are never freed: a crashing thread may be reading one at any time.
static PREVIOUS_ACTIONS: [AtomicPtr<SigAction>; MAX_SIGNALS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_SIGNALS];
static ALT_STACK_CREATED: AtomicBool = AtomicBool::new(false);

type PanicHook = dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static;
type SigactionFn = extern "C" fn(libc::c_int, *mut siginfo_t, *mut c_void);

#[derive(Debug, thiserror::Error)]
pub enum HandlerRegistryError {
    #[error("Crash handlers are already installed")]
    AlreadyInstalled,
    #[error("Crash handlers are not installed")]
    NotInstalled,
    #[error("Signal {0} cannot be handled")]
    InvalidSignal(i32),
    #[error("Failed to create the alternate signal stack: {0}")]
    AltStack(&'static str),
}

/// Where a handler lives, resolved with `dladdr(3)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FunctionInfo {
    pub address: usize,
    pub name: Option<String>,
    pub image_name: Option<String>,
    pub image_path: Option<String>,
}

impl FunctionInfo {
    pub fn resolve(address: usize) -> Self {
        let mut info = libc::Dl_info {
            dli_fname: ptr::null(),
            dli_fbase: ptr::null_mut(),
            dli_sname: ptr::null(),
            dli_saddr: ptr::null_mut(),
        };
        // SAFETY: dladdr accepts any address and only writes to `info`.
        let res = unsafe { libc::dladdr(address as *const c_void, &mut info) };
        if res == 0 {
            return Self {
                address,
                name: None,
                image_name: None,
                image_path: None,
            };
        }
        // SAFETY: when non-null, these point to nul-terminated strings owned by the loader.
        let image_path = (!info.dli_fbase.is_null() && !info.dli_fname.is_null())
            .then(|| unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy().into_owned());
        let name = (!info.dli_saddr.is_null() && !info.dli_sname.is_null())
            .then(|| unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy().into_owned());
        let image_name = image_path.as_deref().map(|path| {
            std::path::Path::new(path)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string())
        });
        Self {
            address,
            name,
            image_name,
            image_path,
        }
    }
}

/// What a signal is set to do.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum HandlerInfo {
    Default,
    Ignore,
    Function(FunctionInfo),
}

impl HandlerInfo {
    fn from_raw(handler: libc::sighandler_t) -> Self {
        match handler {
            libc::SIG_DFL => HandlerInfo::Default,
            libc::SIG_IGN => HandlerInfo::Ignore,
            address => HandlerInfo::Function(FunctionInfo::resolve(address)),
        }
    }

    fn from_sigaction(action: &SigAction) -> Self {
        match action.handler() {
            SigHandler::SigDfl => HandlerInfo::Default,
            SigHandler::SigIgn => HandlerInfo::Ignore,
            SigHandler::Handler(f) => HandlerInfo::Function(FunctionInfo::resolve(f as usize)),
            SigHandler::SigAction(f) => HandlerInfo::Function(FunctionInfo::resolve(f as usize)),
        }
    }

    pub fn address(&self) -> Option<usize> {
        match self {
            HandlerInfo::Function(f) => Some(f.address),
            _ => None,
        }
    }
}

/// One full set of crash handlers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HandlerDescriptor {
    /// Mach exception port.  Only meaningful on Apple platforms, always `None` here.
    pub exception_port: Option<u32>,
    pub signal_handlers: BTreeMap<i32, HandlerInfo>,
    /// In the current handlers, only known while it is ours: a panic hook cannot be inspected
    /// without taking it out.
    pub uncaught_exception_handler: Option<FunctionInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CrashReporterState {
    /// What the process would run right now.
    pub current_handlers: HandlerDescriptor,
    /// What we installed.
    pub own_handlers: HandlerDescriptor,
    /// Per signal, whether our handler is the active one.
    pub signals_active: BTreeMap<i32, bool>,
    pub uncaught_exception_handler_active: bool,
    /// True when every handler we manage is ours and first in line.
    pub is_active: bool,
}

struct Installed {
    previous: HandlerDescriptor,
    own: HandlerDescriptor,
    previous_actions: BTreeMap<i32, (signal::Signal, SigAction)>,
    previous_panic_hook: Option<Arc<PanicHook>>,
    own_panic_hook: Option<OwnPanicHook>,
}

#[derive(Clone, Copy)]
struct OwnPanicHook {
    address: usize,
    id: u64,
}

pub struct HandlerRegistry {
    signals: Vec<i32>,
    /// Handled with `handle_termination_sigaction` instead of the crash handler.
    termination_signals: Vec<i32>,
    create_alt_stack: bool,
    use_alt_stack: bool,
    installed: Option<Installed>,
}

impl HandlerRegistry {
    pub fn new(config: &CrashReportingConfiguration) -> Self {
        Self {
            signals: config.signals().clone(),
            termination_signals: if config.force_restart_enabled() {
                vec![libc::SIGTERM]
            } else {
                vec![]
            },
            create_alt_stack: config.create_alt_stack(),
            use_alt_stack: config.use_alt_stack(),
            installed: None,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.installed.is_some()
    }

    /// Every signal we take over, with the handler we install for it.
    fn managed_signals(&self) -> Vec<(i32, SigactionFn)> {
        let crash = self
            .signals
            .iter()
            .map(|signum| (*signum, handle_posix_sigaction as SigactionFn));
        let termination = self
            .termination_signals
            .iter()
            .filter(|signum| !self.signals.contains(signum))
            .map(|signum| (*signum, handle_termination_sigaction as SigactionFn));
        crash.chain(termination).collect()
    }

    /// Records the current handlers, then replaces them with ours.
    ///
    /// A signal whose handler cannot be replaced is logged and reported as not active by
    /// [`Self::current_state`]; it does not fail the installation.
    ///
    /// ATOMICITY:
    ///     If a crash occurs between our handler being registered and the previous one being
    ///     published, chaining falls back to the default action.
    pub fn install_fatal_handlers(
        &mut self,
        install_panic_hook: bool,
    ) -> Result<(), HandlerRegistryError> {
        if self.installed.is_some() {
            return Err(HandlerRegistryError::AlreadyInstalled);
        }
        let managed = self.managed_signals();
        for (signum, _) in &managed {
            if *signum <= 0 || *signum >= MAX_SIGNALS as i32 {
                return Err(HandlerRegistryError::InvalidSignal(*signum));
            }
        }

        if self.create_alt_stack && !ALT_STACK_CREATED.swap(true, SeqCst) {
            // SAFETY: This function has no documented preconditions.
            if let Err(e) = unsafe { create_alt_stack() } {
                ALT_STACK_CREATED.store(false, SeqCst);
                return Err(e);
            }
        }

        let mut previous = HandlerDescriptor::default();
        let mut own = HandlerDescriptor::default();
        let mut previous_actions = BTreeMap::new();

        for (signum, handler) in managed {
            // SAFETY: This function has no documented preconditions.
            match unsafe { register_signal_handler(signum, self.use_alt_stack, handler) } {
                Ok((signal_type, old_action)) => {
                    let old_ptr = Box::into_raw(Box::new(old_action));
                    // The previous entry, if any, is leaked on purpose.
                    PREVIOUS_ACTIONS[signum as usize].store(old_ptr, SeqCst);
                    previous
                        .signal_handlers
                        .insert(signum, HandlerInfo::from_sigaction(&old_action));
                    own.signal_handlers.insert(
                        signum,
                        HandlerInfo::Function(FunctionInfo::resolve(handler as usize)),
                    );
                    previous_actions.insert(signum, (signal_type, old_action));
                }
                Err(e) => {
                    tracing::warn!(signum, "Unable to register crash handler: {e:#}");
                }
            }
        }

        let (previous_panic_hook, own_panic_hook) = if install_panic_hook {
            let old_hook: Arc<PanicHook> = Arc::from(panic::take_hook());
            previous.uncaught_exception_handler =
                Some(FunctionInfo::resolve(hook_address(&*old_hook)));
            let hook = PanicMessageHook::new(old_hook.clone());
            let id = hook.id();
            let boxed: Box<PanicHook> =
                Box::new(move |info: &PanicHookInfo<'_>| hook.call(info));
            let address = hook_address(&*boxed);
            own.uncaught_exception_handler = Some(FunctionInfo::resolve(address));
            panic::set_hook(boxed);
            (Some(old_hook), Some(OwnPanicHook { address, id }))
        } else {
            (None, None)
        };

        tracing::debug!(
            signals = ?previous_actions.keys().collect::<Vec<_>>(),
            panic_hook = install_panic_hook,
            "Installed crash handlers"
        );
        self.installed = Some(Installed {
            previous,
            own,
            previous_actions,
            previous_panic_hook,
            own_panic_hook,
        });
        Ok(())
    }

    /// Puts back the handlers recorded by `install_fatal_handlers`.
    ///
    /// A slot that someone else took over since we installed ours is left alone: restoring it
    /// would silently uninstall their handler.
    pub fn restore_previous(&mut self) -> Result<(), HandlerRegistryError> {
        let installed = self
            .installed
            .take()
            .ok_or(HandlerRegistryError::NotInstalled)?;

        for (signum, (signal_type, action)) in &installed.previous_actions {
            let own = installed
                .own
                .signal_handlers
                .get(signum)
                .and_then(HandlerInfo::address);
            if query_handler(*signum) != own {
                tracing::warn!(signum, "Crash handler was replaced, not restoring");
                continue;
            }
            // SAFETY: restoring a handler that was installed before ours.
            if let Err(e) = unsafe { signal::sigaction(*signal_type, action) } {
                tracing::warn!(signum, "Unable to restore previous handler: {e}");
            }
        }

        if let (Some(own), Some(previous)) =
            (installed.own_panic_hook, installed.previous_panic_hook)
        {
            let current = panic::take_hook();
            if hook_address(&*current) == own.address {
                panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| (*previous)(info)));
            } else {
                tracing::warn!("Panic hook was replaced, not restoring");
                panic::set_hook(current);
            }
        }
        tracing::debug!("Restored previous crash handlers");
        Ok(())
    }

    /// The handlers that were active when ours were installed.
    pub fn previous_handlers(&self) -> Option<&HandlerDescriptor> {
        self.installed.as_ref().map(|i| &i.previous)
    }

    pub fn current_state(&self) -> CrashReporterState {
        let own = self
            .installed
            .as_ref()
            .map(|i| i.own.clone())
            .unwrap_or_default();
        let mut current = HandlerDescriptor::default();
        let mut signals_active = BTreeMap::new();
        for (signum, _) in self.managed_signals() {
            let Some(handler) = query_handler(signum) else {
                signals_active.insert(signum, false);
                continue;
            };
            current
                .signal_handlers
                .insert(signum, HandlerInfo::from_raw(handler));
            let own_address = own.signal_handlers.get(&signum).and_then(HandlerInfo::address);
            signals_active.insert(signum, self.installed.is_some() && own_address == Some(handler));
        }

        // Replacing a panic hook drops the old one, so ours is still in line while it is alive.
        // Taking the hook out to look at it would abort on a panicking thread.
        let own_panic_hook = self.installed.as_ref().and_then(|i| i.own_panic_hook);
        let uncaught_exception_handler_active =
            own_panic_hook.is_some_and(|hook| live_panic_hook() == hook.id);
        if uncaught_exception_handler_active {
            current.uncaught_exception_handler = own.uncaught_exception_handler.clone();
        }

        let is_active = self.installed.is_some()
            && signals_active.values().all(|active| *active)
            && (own_panic_hook.is_none() || uncaught_exception_handler_active);

        CrashReporterState {
            current_handlers: current,
            own_handlers: own,
            signals_active,
            uncaught_exception_handler_active,
            is_active,
        }
    }
}

/// Address of the data behind a boxed hook.  Our hook captures state, so its address is unique.
fn hook_address(hook: &PanicHook) -> usize {
    hook as *const PanicHook as *const () as usize
}

/// Reads the installed handler without changing it.
fn query_handler(signum: i32) -> Option<libc::sighandler_t> {
    // SAFETY: a zeroed sigaction is a valid out parameter.
    let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
    // SAFETY: a null `act` only queries.
    let rval = unsafe { libc::sigaction(signum, ptr::null(), &mut current) };
    (rval == 0).then_some(current.sa_sigaction)
}

/// Once we've handled the signal, chain to any previous handlers.
///
/// SAFETY: If we crash in the instant between our handler being registered and the previous one
/// being published, there is nothing to chain to; we restore the default action and re-raise.
pub(crate) unsafe fn chain_signal_handler(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    if signum <= 0 || signum >= MAX_SIGNALS as i32 {
        eprintln!("Unexpected value for {signum}, cannot chain, aborting");
        libc::abort();
    }
    let previous = PREVIOUS_ACTIONS[signum as usize].load(SeqCst);
    // SAFETY: non-null entries come from `Box::into_raw` and are never freed.
    let Some(action) = (unsafe { previous.as_ref() }) else {
        restore_default_and_raise(signum);
        return;
    };
    // How we chain depends on what kind of handler we're chaining to.
    // https://www.gnu.org/software/libc/manual/html_node/Signal-Handling.html
    // https://man7.org/linux/man-pages/man2/sigaction.2.html
    match action.handler() {
        SigHandler::SigDfl => restore_default_and_raise(signum),
        SigHandler::SigIgn => (), // Return and ignore the signal.
        SigHandler::Handler(f) => f(signum),
        SigHandler::SigAction(f) => f(signum, sig_info, ucontext),
    }
}

/// Invokes the default action, so that a core dump can be generated and the exit status reflects
/// the signal.
fn restore_default_and_raise(signum: i32) {
    // SAFETY: sigaction and raise are async-signal-safe.
    unsafe {
        let mut default: libc::sigaction = std::mem::zeroed();
        default.sa_sigaction = libc::SIG_DFL;
        if libc::sigaction(signum, &default, ptr::null_mut()) != 0 {
            libc::abort();
        }
        // Signals are only delivered once.  Returning from a hardware fault re-executes the
        // faulting instruction, but a signal sent with `raise` has to be raised again.
        libc::raise(signum);
    }
}

/// Allocates a signal altstack, and puts a guard page at the end.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
unsafe fn create_alt_stack() -> Result<(), HandlerRegistryError> {
    // The greater of 16 pages or SIGSTKSZ: the default SIGSTKSZ (8KB) is too tight once user
    // callbacks run on it.
    let page_size = page_size::get();
    let sigalstack_base_size = std::cmp::max(SIGSTKSZ, 16 * page_size);
    let stackp = mmap(
        ptr::null_mut(),
        sigalstack_base_size + page_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    if stackp == MAP_FAILED {
        return Err(HandlerRegistryError::AltStack("mmap failed"));
    }
    if libc::mprotect(stackp, page_size, PROT_NONE) != 0 {
        return Err(HandlerRegistryError::AltStack("guard page setup failed"));
    }
    let stackp = stackp.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: sigalstack_base_size,
    };
    if sigaltstack(&stack, ptr::null_mut()) != 0 {
        return Err(HandlerRegistryError::AltStack("sigaltstack failed"));
    }
    Ok(())
}

unsafe fn register_signal_handler(
    signum: i32,
    use_alt_stack: bool,
    handler: SigactionFn,
) -> anyhow::Result<(signal::Signal, SigAction)> {
    let signal_type = signal_from_signum(signum)?;

    // Some runtimes check the stack pointer in their own (chained) handler and expect the
    // altstack they set up, so using the altstack is independent from creating it.
    let extra_saflags = if use_alt_stack {
        SaFlags::SA_ONSTACK
    } else {
        SaFlags::empty()
    };

    let sig_action = SigAction::new(
        SigHandler::SigAction(handler),
        SaFlags::SA_NODEFER | extra_saflags,
        signal::SigSet::empty(),
    );

    let old_handler = signal::sigaction(signal_type, &sig_action)?;
    Ok((signal_type, old_handler))
}
