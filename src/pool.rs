//! A bounded pool of token sessions.
//!
//! PKCS#11 sessions must not be used by more than one thread at a time, while the users of token keys expect to be
//! able to use them from as many threads as they like. The [`SessionPool`] bridges the two: every operation leases
//! a session for its own exclusive use and returns it when done.
//!
//! Sessions are opened lazily by a session factory, which is anything implementing [`r2d2::ManageConnection`], up
//! to a maximum. Returned sessions are kept for reuse, unless they have been idle for longer than the idle timeout
//! in which case they are closed. When all sessions are leased callers wait, for at most their wait budget, for one
//! to be returned.

use std::{
    fmt,
    marker::PhantomData,
    mem::{self, ManuallyDrop},
    ops::{Deref, DerefMut},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak},
    thread,
    time::{Duration, Instant},
};

use r2d2::ManageConnection;

use crate::{constants::MIN_REAPER_INTERVAL, error::Error};

//------------ Builder -------------------------------------------------------

/// Configures and creates a [`SessionPool`].
pub struct Builder<M> {
    max_size: u32,
    idle_timeout: Option<Duration>,
    connection_timeout: Option<Duration>,
    test_on_check_out: bool,
    _manager: PhantomData<M>,
}

impl<M: ManageConnection> Default for Builder<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: ManageConnection> Builder<M> {
    pub fn new() -> Self {
        Builder {
            max_size: 10,
            idle_timeout: None,
            connection_timeout: None,
            test_on_check_out: false,
            _manager: PhantomData,
        }
    }

    /// The maximum number of sessions, leased and idle together. A pool always allows at least one.
    pub fn max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    /// Sessions idle for longer than this are closed. `None` or zero keeps idle sessions forever.
    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout.filter(|timeout| !timeout.is_zero());
        self
    }

    /// The wait budget used by [`SessionPool::get`]. `None` waits until a session is available.
    pub fn connection_timeout(mut self, connection_timeout: Option<Duration>) -> Self {
        self.connection_timeout = connection_timeout;
        self
    }

    /// Ask the session factory whether an idle session is still valid before leasing it out.
    pub fn test_on_check_out(mut self, test_on_check_out: bool) -> Self {
        self.test_on_check_out = test_on_check_out;
        self
    }

    /// Creates the pool. No sessions are opened until they are asked for.
    pub fn build(self, manager: M) -> SessionPool<M> {
        let config = Config {
            max_size: self.max_size,
            idle_timeout: self.idle_timeout,
            connection_timeout: self.connection_timeout,
            test_on_check_out: self.test_on_check_out,
        };

        let shared = Arc::new(SharedPool {
            config,
            manager,
            internals: Mutex::new(PoolInternals {
                idle: Vec::new(),
                sessions: 0,
                leased: 0,
                closing: false,
            }),
            available: Condvar::new(),
            drained: Condvar::new(),
            reaper: Mutex::new(None),
        });

        if let Some(idle_timeout) = self.idle_timeout {
            let reaper = spawn_reaper(&shared, idle_timeout);
            *lock(&shared.reaper) = reaper;
        }

        SessionPool { shared }
    }
}

#[derive(Clone, Copy, Debug)]
struct Config {
    max_size: u32,
    idle_timeout: Option<Duration>,
    connection_timeout: Option<Duration>,
    test_on_check_out: bool,
}

//------------ SessionPool ---------------------------------------------------

/// A pool of sessions opened by the session factory `M`. Cloning gives another handle to the same pool.
pub struct SessionPool<M: ManageConnection> {
    shared: Arc<SharedPool<M>>,
}

impl<M: ManageConnection> Clone for SessionPool<M> {
    fn clone(&self) -> Self {
        SessionPool {
            shared: self.shared.clone(),
        }
    }
}

impl<M: ManageConnection> fmt::Debug for SessionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool").field("state", &self.state()).finish()
    }
}

struct SharedPool<M: ManageConnection> {
    config: Config,

    manager: M,

    internals: Mutex<PoolInternals<M::Connection>>,

    /// Signalled whenever a session is returned, capacity is freed or the pool starts closing.
    available: Condvar,

    /// Signalled when the last leased session is returned.
    drained: Condvar,

    reaper: Mutex<Option<thread::JoinHandle<()>>>,
}

struct PoolInternals<C> {
    /// Sessions available for lease, the most recently returned last.
    idle: Vec<IdleSession<C>>,

    /// All sessions currently open or being opened, whether idle or leased.
    sessions: u32,

    leased: u32,

    closing: bool,
}

struct IdleSession<C> {
    session: C,
    idle_since: Instant,
}

impl<C> PoolInternals<C> {
    /// Removes the sessions which have been idle for longer than `idle_timeout`. The caller closes them, preferably
    /// after releasing the lock.
    fn take_expired(&mut self, idle_timeout: Option<Duration>, now: Instant) -> Vec<C> {
        let idle_timeout = match idle_timeout {
            Some(idle_timeout) => idle_timeout,
            None => return Vec::new(),
        };

        let (expired, keep): (Vec<_>, Vec<_>) = mem::take(&mut self.idle)
            .into_iter()
            .partition(|idle| now.saturating_duration_since(idle.idle_since) > idle_timeout);
        self.idle = keep;
        self.sessions -= expired.len() as u32;

        expired.into_iter().map(|idle| idle.session).collect()
    }
}

impl<M: ManageConnection> SessionPool<M> {
    pub fn builder() -> Builder<M> {
        Builder::new()
    }

    /// Leases a session, waiting for at most the configured wait budget.
    pub fn get(&self) -> Result<PooledSession<M>, Error> {
        self.acquire(self.shared.config.connection_timeout)
    }

    /// Leases a session, waiting for at most `timeout`. A zero timeout never blocks.
    pub fn get_timeout(&self, timeout: Duration) -> Result<PooledSession<M>, Error> {
        self.acquire(Some(timeout))
    }

    /// Returns the current accounting of the pool.
    pub fn state(&self) -> State {
        let internals = self.shared.lock();
        State {
            max_size: self.shared.config.max_size,
            sessions: internals.sessions,
            idle_sessions: internals.idle.len() as u32,
            leased: internals.leased,
        }
    }

    /// The session factory this pool was built with.
    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closing
    }

    /// Closes the pool.
    ///
    /// From the moment this is called every attempt to lease a session fails with [`Error::Closed`], including
    /// attempts that were already waiting. Sessions that are currently leased are waited for: this only returns once
    /// all of them have been returned, after which all sessions are closed. Must not be called by a thread that
    /// holds a leased session itself.
    pub fn close(&self) {
        let mut internals = self.shared.lock();
        if !internals.closing {
            internals.closing = true;
            debug!("Closing session pool with {} leased sessions", internals.leased);
        }
        self.shared.available.notify_all();

        while internals.leased > 0 {
            trace!("Waiting for {} leased sessions to be returned", internals.leased);
            internals = self.shared.drained.wait(internals).unwrap_or_else(PoisonError::into_inner);
        }

        let idle = mem::take(&mut internals.idle);
        internals.sessions -= idle.len() as u32;
        drop(internals);

        if !idle.is_empty() {
            debug!("Closing {} idle sessions", idle.len());
        }
        drop(idle);

        let reaper = lock(&self.shared.reaper).take();
        if let Some(reaper) = reaper {
            reaper.thread().unpark();
            if reaper.join().is_err() {
                warn!("Session pool reaper thread panicked");
            }
        }
    }

    fn acquire(&self, timeout: Option<Duration>) -> Result<PooledSession<M>, Error> {
        let config = self.shared.config;
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));

        let mut internals = self.shared.lock();
        loop {
            if internals.closing {
                return Err(Error::Closed);
            }

            let expired = internals.take_expired(config.idle_timeout, Instant::now());
            if !expired.is_empty() {
                drop(internals);
                debug!("Closing {} sessions that were idle for too long", expired.len());
                drop(expired);
                internals = self.shared.lock();
                continue;
            }

            if let Some(idle) = internals.idle.pop() {
                internals.leased += 1;
                drop(internals);

                let mut session = idle.session;
                if config.test_on_check_out {
                    if let Err(err) = self.shared.manager.is_valid(&mut session) {
                        debug!("Discarding idle session that is no longer valid: {}", err);
                        self.shared.put_back(session, true);
                        internals = self.shared.lock();
                        continue;
                    }
                }

                trace!("Leasing idle session");
                return Ok(self.lease(session));
            }

            if internals.sessions < config.max_size {
                // Reserve the capacity before opening the session so that concurrent callers cannot overshoot the
                // maximum while we wait for the token.
                internals.sessions += 1;
                internals.leased += 1;
                let sessions = internals.sessions;
                drop(internals);

                return match self.shared.manager.connect() {
                    Ok(session) => {
                        debug!("Opened session {} of at most {}", sessions, config.max_size);
                        Ok(self.lease(session))
                    }
                    Err(err) => {
                        self.shared.release_reservation();
                        Err(Error::SessionCreationFailed(err.to_string()))
                    }
                };
            }

            internals = match deadline {
                None => self.shared.available.wait(internals).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::PoolExhausted);
                    }
                    self.shared
                        .available
                        .wait_timeout(internals, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn lease(&self, session: M::Connection) -> PooledSession<M> {
        PooledSession {
            pool: self.shared.clone(),
            session: ManuallyDrop::new(session),
            discard: false,
        }
    }
}

impl<M: ManageConnection> SharedPool<M> {
    fn lock(&self) -> MutexGuard<'_, PoolInternals<M::Connection>> {
        lock(&self.internals)
    }

    /// Takes back a leased session, keeping it for reuse unless it must be discarded or the pool is closing.
    fn put_back(&self, mut session: M::Connection, discard: bool) {
        let discard = discard || self.manager.has_broken(&mut session);

        let mut internals = self.lock();
        internals.leased -= 1;
        let to_close = if discard || internals.closing {
            internals.sessions -= 1;
            Some(session)
        } else {
            internals.idle.push(IdleSession {
                session,
                idle_since: Instant::now(),
            });
            None
        };
        self.notify(&internals);
        drop(internals);

        if to_close.is_some() {
            if discard {
                debug!("Discarded a broken session");
            }
            drop(to_close);
        }
    }

    /// Gives back capacity that was reserved for a session the factory failed to open.
    fn release_reservation(&self) {
        let mut internals = self.lock();
        internals.sessions -= 1;
        internals.leased -= 1;
        self.notify(&internals);
    }

    fn notify(&self, internals: &PoolInternals<M::Connection>) {
        self.available.notify_all();
        if internals.leased == 0 {
            self.drained.notify_all();
        }
    }

    /// Closes expired idle sessions. Returns false once the pool is closing.
    fn reap(&self) -> bool {
        let mut internals = self.lock();
        if internals.closing {
            return false;
        }
        let expired = internals.take_expired(self.config.idle_timeout, Instant::now());
        if !expired.is_empty() {
            self.available.notify_all();
        }
        drop(internals);

        if !expired.is_empty() {
            debug!("Reaper closing {} sessions that were idle for too long", expired.len());
        }
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Starts a thread that closes idle sessions even when nobody asks the pool for one. The thread only holds a weak
/// reference to the pool, so it stops by itself once the pool is dropped.
fn spawn_reaper<M: ManageConnection>(
    shared: &Arc<SharedPool<M>>,
    idle_timeout: Duration,
) -> Option<thread::JoinHandle<()>> {
    let pool: Weak<SharedPool<M>> = Arc::downgrade(shared);
    let interval = (idle_timeout / 2).max(MIN_REAPER_INTERVAL);

    let res = thread::Builder::new()
        .name("pkcs11-session-reaper".to_string())
        .spawn(move || {
            loop {
                thread::park_timeout(interval);
                let pool = match pool.upgrade() {
                    Some(pool) => pool,
                    None => break,
                };
                if !pool.reap() {
                    break;
                }
            }
        });

    match res {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!("Could not start session reaper, idle sessions are only closed on lease: {}", err);
            None
        }
    }
}

//------------ State ---------------------------------------------------------

/// A snapshot of the pool accounting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct State {
    pub max_size: u32,

    /// Open sessions, idle and leased.
    pub sessions: u32,

    pub idle_sessions: u32,

    pub leased: u32,
}

impl State {
    /// How many more sessions may be opened.
    pub fn available_capacity(&self) -> u32 {
        self.max_size - self.sessions
    }
}

//------------ PooledSession -------------------------------------------------

/// A session leased from a [`SessionPool`]. The lease ends when this is dropped.
pub struct PooledSession<M: ManageConnection> {
    pool: Arc<SharedPool<M>>,
    session: ManuallyDrop<M::Connection>,
    discard: bool,
}

impl<M: ManageConnection> PooledSession<M> {
    /// Makes sure the session is closed instead of being reused when the lease ends.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<M: ManageConnection> Deref for PooledSession<M> {
    type Target = M::Connection;

    fn deref(&self) -> &M::Connection {
        &self.session
    }
}

impl<M: ManageConnection> DerefMut for PooledSession<M> {
    fn deref_mut(&mut self) -> &mut M::Connection {
        &mut self.session
    }
}

impl<M: ManageConnection> fmt::Debug for PooledSession<M>
where
    M::Connection: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession").field("session", &*self.session).finish()
    }
}

impl<M: ManageConnection> Drop for PooledSession<M> {
    fn drop(&mut self) {
        // SAFETY: the session is not touched again after it has been taken here.
        let session = unsafe { ManuallyDrop::take(&mut self.session) };
        self.pool.put_back(session, self.discard);
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        mpsc,
    };

    use super::*;

    #[derive(Debug)]
    struct FakeSession {
        id: u32,
        broken: bool,
        closed: Arc<AtomicUsize>,
    }

    impl Drop for FakeSession {
        fn drop(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Opens numbered sessions, optionally failing some attempts.
    #[derive(Default)]
    struct FakeManager {
        opened: AtomicU32,
        closed: Arc<AtomicUsize>,
        fail_next_connect: AtomicBool,
        invalid_ids: Mutex<Vec<u32>>,
    }

    impl FakeManager {
        fn opened(&self) -> u32 {
            self.opened.load(Ordering::SeqCst)
        }

        fn closed(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl ManageConnection for FakeManager {
        type Connection = FakeSession;
        type Error = Error;

        fn connect(&self) -> Result<FakeSession, Error> {
            if self.fail_next_connect.swap(false, Ordering::SeqCst) {
                return Err(Error::Library("no more sessions".to_string()));
            }
            let id = self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(FakeSession {
                id,
                broken: false,
                closed: self.closed.clone(),
            })
        }

        fn is_valid(&self, session: &mut FakeSession) -> Result<(), Error> {
            if self.invalid_ids.lock().unwrap().contains(&session.id) {
                Err(Error::Closed)
            } else {
                Ok(())
            }
        }

        fn has_broken(&self, session: &mut FakeSession) -> bool {
            session.broken
        }
    }

    fn pool(max_size: u32) -> SessionPool<FakeManager> {
        SessionPool::builder().max_size(max_size).build(FakeManager::default())
    }

    #[test]
    fn sessions_are_opened_lazily_and_reused() {
        let pool = pool(4);
        assert_eq!(pool.state().sessions, 0);
        assert_eq!(pool.manager().opened(), 0);

        let id = pool.get().unwrap().id;
        let again = pool.get().unwrap().id;
        assert_eq!(id, again);
        assert_eq!(pool.manager().opened(), 1);

        let state = pool.state();
        assert_eq!(state.sessions, 1);
        assert_eq!(state.idle_sessions, 1);
        assert_eq!(state.leased, 0);
    }

    #[test]
    fn never_more_sessions_than_max_size() {
        let pool = pool(3);
        let in_use = Arc::new(AtomicU32::new(0));
        let max_in_use = Arc::new(AtomicU32::new(0));

        let threads: Vec<_> = (0..12)
            .map(|_| {
                let pool = pool.clone();
                let in_use = in_use.clone();
                let max_in_use = max_in_use.clone();
                thread::spawn(move || {
                    let session = pool.get().unwrap();
                    let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_use.fetch_max(now, Ordering::SeqCst);
                    assert!(pool.state().sessions <= 3);
                    thread::sleep(Duration::from_millis(20));
                    in_use.fetch_sub(1, Ordering::SeqCst);
                    drop(session);
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert!(max_in_use.load(Ordering::SeqCst) <= 3);
        assert!(pool.manager().opened() <= 3);
        assert_eq!(pool.state().leased, 0);
    }

    #[test]
    fn caller_beyond_max_size_waits_for_a_release() {
        let pool = pool(2);
        let first = pool.get().unwrap();
        let _second = pool.get().unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let session = pool.get_timeout(Duration::from_secs(5)).unwrap();
                tx.send(session.id).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        let first_id = first.id;
        drop(first);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), first_id);
        waiter.join().unwrap();
        assert_eq!(pool.manager().opened(), 2);
    }

    #[test]
    fn zero_wait_budget_fails_immediately_when_exhausted() {
        let pool = pool(1);
        let _held = pool.get().unwrap();

        let start = Instant::now();
        assert!(matches!(pool.get_timeout(Duration::ZERO), Err(Error::PoolExhausted)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn huge_wait_budget_waits_without_a_deadline() {
        let pool = pool(1);
        assert!(pool.get_timeout(Duration::MAX).is_ok());

        let held = pool.get().unwrap();
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let session = pool.get_timeout(Duration::MAX).unwrap();
                tx.send(session.id).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        let held_id = held.id;
        drop(held);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), held_id);
        waiter.join().unwrap();
    }

    #[test]
    fn zero_wait_budget_may_still_open_a_session() {
        let pool = pool(1);
        assert!(pool.get_timeout(Duration::ZERO).is_ok());
    }

    #[test]
    fn wait_budget_elapses() {
        let pool = SessionPool::builder()
            .max_size(1)
            .connection_timeout(Some(Duration::from_millis(50)))
            .build(FakeManager::default());
        let _held = pool.get().unwrap();

        let start = Instant::now();
        assert!(matches!(pool.get(), Err(Error::PoolExhausted)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn idle_session_is_not_reused_after_idle_timeout() {
        let pool = SessionPool::builder()
            .max_size(2)
            .idle_timeout(Some(Duration::from_millis(50)))
            .build(FakeManager::default());

        let first = pool.get().unwrap().id;
        thread::sleep(Duration::from_millis(120));
        let second = pool.get().unwrap().id;

        assert_ne!(first, second);
        assert_eq!(pool.manager().opened(), 2);
        assert_eq!(pool.manager().closed(), 1);
        assert_eq!(pool.state().sessions, 1);
    }

    #[test]
    fn reaper_closes_idle_sessions() {
        let pool = SessionPool::builder()
            .max_size(4)
            .idle_timeout(Some(Duration::from_millis(40)))
            .build(FakeManager::default());

        {
            let _a = pool.get().unwrap();
            let _b = pool.get().unwrap();
        }
        assert_eq!(pool.state().idle_sessions, 2);

        thread::sleep(Duration::from_millis(300));
        let state = pool.state();
        assert_eq!(state.idle_sessions, 0);
        assert_eq!(state.sessions, 0);
        assert_eq!(state.available_capacity(), 4);
        assert_eq!(pool.manager().closed(), 2);
    }

    #[test]
    fn accounting_holds_over_many_eviction_cycles() {
        let pool = SessionPool::builder()
            .max_size(2)
            .idle_timeout(Some(Duration::from_millis(5)))
            .build(FakeManager::default());

        for _ in 0..20 {
            let a = pool.get().unwrap();
            let b = pool.get().unwrap();
            assert!(pool.state().sessions <= 2);
            drop(a);
            drop(b);
            thread::sleep(Duration::from_millis(12));
            assert!(pool.state().sessions <= 2);
        }

        let opened = pool.manager().opened() as usize;
        assert_eq!(opened - pool.manager().closed(), pool.state().sessions as usize);
    }

    #[test]
    fn discarded_session_frees_capacity() {
        let pool = pool(2);
        let mut session = pool.get().unwrap();
        assert_eq!(pool.state().available_capacity(), 1);

        session.discard();
        drop(session);

        let state = pool.state();
        assert_eq!(state.sessions, 0);
        assert_eq!(state.available_capacity(), 2);
        assert_eq!(pool.manager().closed(), 1);

        let next = pool.get().unwrap();
        assert_eq!(next.id, 1);
    }

    #[test]
    fn broken_session_is_not_reused() {
        let pool = pool(2);
        let mut session = pool.get().unwrap();
        session.broken = true;
        drop(session);

        assert_eq!(pool.state().sessions, 0);
        assert_eq!(pool.get().unwrap().id, 1);
    }

    #[test]
    fn factory_failure_does_not_leak_capacity() {
        let pool = pool(1);
        pool.manager().fail_next_connect.store(true, Ordering::SeqCst);

        assert!(matches!(pool.get(), Err(Error::SessionCreationFailed(_))));
        let state = pool.state();
        assert_eq!(state.sessions, 0);
        assert_eq!(state.leased, 0);

        assert!(pool.get().is_ok());
    }

    #[test]
    fn invalid_idle_session_is_replaced_on_check_out() {
        let pool = SessionPool::builder()
            .max_size(1)
            .test_on_check_out(true)
            .build(FakeManager::default());

        assert_eq!(pool.get().unwrap().id, 0);
        pool.manager().invalid_ids.lock().unwrap().push(0);
        assert_eq!(pool.get().unwrap().id, 1);
        assert_eq!(pool.state().sessions, 1);
    }

    #[test]
    fn close_waits_for_leased_sessions() {
        let pool = pool(3);
        let done = Arc::new(AtomicUsize::new(0));
        let (leased_tx, leased_rx) = mpsc::channel();

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let pool = pool.clone();
                let done = done.clone();
                let leased_tx = leased_tx.clone();
                thread::spawn(move || {
                    let session = pool.get().unwrap();
                    leased_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(100));
                    done.fetch_add(1, Ordering::SeqCst);
                    drop(session);
                })
            })
            .collect();

        for _ in 0..3 {
            leased_rx.recv().unwrap();
        }

        pool.close();
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(pool.manager().closed(), 3);
        assert_eq!(pool.state().sessions, 0);

        for w in workers {
            w.join().unwrap();
        }
    }

    #[test]
    fn closed_pool_refuses_leases() {
        let pool = pool(1);
        drop(pool.get().unwrap());
        pool.close();

        assert!(pool.is_closed());
        assert!(matches!(pool.get(), Err(Error::Closed)));
        assert!(matches!(pool.get_timeout(Duration::ZERO), Err(Error::Closed)));
        assert_eq!(pool.manager().opened(), 1);

        // closing again is harmless
        pool.close();
    }

    #[test]
    fn close_wakes_up_waiters() {
        let pool = pool(1);
        let held = pool.get().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.get().map(|_| ()))
        };
        thread::sleep(Duration::from_millis(50));

        let closer = {
            let pool = pool.clone();
            thread::spawn(move || pool.close())
        };

        assert!(matches!(waiter.join().unwrap(), Err(Error::Closed)));

        drop(held);
        closer.join().unwrap();
        assert_eq!(pool.state().sessions, 0);
    }
}
