//! Crash detection through a process-shared robust mutex.
//!
//! The owning instance holds the mutex for its whole lifetime. If the owner dies without
//! releasing it, the kernel marks the mutex and the next acquirer sees `EOWNERDEAD`.
//!
//! The kernel only does that for owners it saw die. A mutex image saved while held, by a power
//! loss or by copying the heap files, stays locked with no owner at all. Whether anyone live
//! holds the heap is therefore decided by the file lock of the meta region, and the mutex only
//! records how the last holder went away.

use core::cell::UnsafeCell;

use crate::persist;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockState {
  /// The previous owner released the mutex.
  Acquired,
  /// The previous owner died holding the mutex; it has been made consistent and is now ours.
  OwnerDied,
  /// Another live owner holds the mutex.
  Busy,
}

#[repr(C, align(64))]
pub struct DirtyLock {
  mutex: UnsafeCell<libc::pthread_mutex_t>,
}

// The mutex is designed for concurrent access; all access goes through pthread calls.
unsafe impl Sync for DirtyLock {}

/// Maps a pthread return code to a `Result`.
#[inline]
fn check(rc: i32) -> Result<(), i32> {
  if rc == 0 { Ok(()) } else { Err(rc) }
}

impl DirtyLock {
  /// Initializes the mutex in place, on fresh metadata or over a stale image.
  pub fn init(&self) -> Result<(), i32> {
    unsafe {
      let mut attr: libc::pthread_mutexattr_t = core::mem::zeroed();
      check(libc::pthread_mutexattr_init(&mut attr))?;
      let rc = (|| {
        check(libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED))?;
        check(libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST))?;
        check(libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_ERRORCHECK))?;
        check(libc::pthread_mutex_init(self.mutex.get(), &attr))
      })();
      libc::pthread_mutexattr_destroy(&mut attr);
      rc?;
    }
    persist::flush(self);
    persist::fence();
    Ok(())
  }

  /// Tries to take ownership without blocking.
  ///
  /// Errors carry the errno of a mutex that can no longer be used.
  pub fn acquire(&self) -> Result<LockState, i32> {
    match unsafe { libc::pthread_mutex_trylock(self.mutex.get()) } {
      0 => Ok(LockState::Acquired),
      libc::EOWNERDEAD => {
        check(unsafe { libc::pthread_mutex_consistent(self.mutex.get()) })?;
        Ok(LockState::OwnerDied)
      }
      libc::EBUSY | libc::EDEADLK => Ok(LockState::Busy),
      rc => Err(rc),
    }
  }

  /// Acquires the mutex on behalf of the only live instance of the heap.
  ///
  /// A mutex that still reads as held can only be a stale image: it is reinitialized in place
  /// and reported as [`LockState::OwnerDied`].
  pub fn take_over(&self) -> Result<LockState, i32> {
    match self.acquire()? {
      LockState::Busy => {
        self.init()?;
        match self.acquire()? {
          LockState::Acquired => Ok(LockState::OwnerDied),
          state => Ok(state),
        }
      }
      state => Ok(state),
    }
  }

  /// Must be called on the thread that acquired the mutex.
  pub fn release(&self) -> Result<(), i32> {
    check(unsafe { libc::pthread_mutex_unlock(self.mutex.get()) })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn lock() -> Box<DirtyLock> {
    let lock: Box<DirtyLock> = Box::new(unsafe { core::mem::zeroed() });
    lock.init().unwrap();
    lock
  }

  #[test]
  fn clean_release_reacquires() {
    let lock = lock();
    assert_eq!(lock.acquire(), Ok(LockState::Acquired));
    lock.release().unwrap();
    assert_eq!(lock.acquire(), Ok(LockState::Acquired));
    lock.release().unwrap();
  }

  #[test]
  fn held_lock_is_busy_elsewhere() {
    let lock = lock();
    assert_eq!(lock.acquire(), Ok(LockState::Acquired));
    std::thread::scope(|s| {
      s.spawn(|| assert_eq!(lock.acquire(), Ok(LockState::Busy)));
    });
    lock.release().unwrap();
  }

  #[test]
  fn dead_owner_is_reported_once() {
    let lock = lock();
    std::thread::scope(|s| {
      // The thread exits while still holding the mutex.
      s.spawn(|| assert_eq!(lock.acquire(), Ok(LockState::Acquired)));
    });
    assert_eq!(lock.acquire(), Ok(LockState::OwnerDied));
    lock.release().unwrap();
    assert_eq!(lock.acquire(), Ok(LockState::Acquired));
    lock.release().unwrap();
  }

  #[test]
  fn stale_held_image_is_taken_over_as_dirty() {
    let lock = lock();
    assert_eq!(lock.acquire(), Ok(LockState::Acquired));
    // The bytes of a held mutex, as a power loss would leave them in the file.
    let image: Box<DirtyLock> = Box::new(unsafe { core::ptr::read(&*lock) });
    assert_eq!(image.acquire(), Ok(LockState::Busy));
    assert_eq!(image.take_over(), Ok(LockState::OwnerDied));
    image.release().unwrap();
    assert_eq!(image.take_over(), Ok(LockState::Acquired));
    image.release().unwrap();
    lock.release().unwrap();
  }
}
