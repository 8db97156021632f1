// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Lock wrappers with the narrow enter/exit API of a kernel lock.
//!
//! A poisoned lock panics the caller.
use core::ops::Deref;
use core::ops::DerefMut;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

macro_rules! guard {
    ($name:ident, $inner:ident $(, $mut:ident)?) => {
        pub struct $name<'a, T: 'a>($inner<'a, T>);

        impl<T> Deref for $name<'_, T> {
            type Target = T;

            fn deref(&self) -> &T {
                &self.0
            }
        }

        $(
            impl<T> DerefMut for $name<'_, T> {
                fn $mut(&mut self) -> &mut T {
                    &mut self.0
                }
            }
        )?
    };
}

guard!(KMutexGuard, MutexGuard, deref_mut);
guard!(KRwLockReadGuard, RwLockReadGuard);
guard!(KRwLockWriteGuard, RwLockWriteGuard, deref_mut);

/// A mutual exclusion lock.
#[derive(Default)]
pub struct KMutex<T>(Mutex<T>);

impl<T> KMutex<T> {
    pub fn new(val: T) -> Self {
        Self(Mutex::new(val))
    }

    pub fn lock(&self) -> KMutexGuard<'_, T> {
        KMutexGuard(self.0.lock().expect("lock poisoned"))
    }
}

/// A reader/writer lock.
pub struct KRwLock<T>(RwLock<T>);

impl<T> KRwLock<T> {
    pub fn new(val: T) -> Self {
        Self(RwLock::new(val))
    }

    pub fn read(&self) -> KRwLockReadGuard<'_, T> {
        KRwLockReadGuard(self.0.read().expect("lock poisoned"))
    }

    pub fn write(&self) -> KRwLockWriteGuard<'_, T> {
        KRwLockWriteGuard(self.0.write().expect("lock poisoned"))
    }
}
