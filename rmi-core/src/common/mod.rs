use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::{seq::IteratorRandom, Rng};

/// Locks `mutex`, ignoring poisoning.
///
/// Shared state guarded this way is only mutated in short, panic-free
/// sections, so a poisoned lock still holds consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Picks two random candidates and returns the one `load` rates lower.
pub(crate) fn power_of_two_choices<I, F>(candidates: I, load: F) -> Option<usize>
where
    I: IntoIterator<Item = usize>,
    F: Fn(usize) -> usize,
{
    let mut rng = rand::thread_rng();
    let picked = candidates.into_iter().choose_multiple(&mut rng, 2);
    match picked.as_slice() {
        [] => None,
        [only] => Some(*only),
        [a, b] => Some(match load(*a).cmp(&load(*b)) {
            std::cmp::Ordering::Less => *a,
            std::cmp::Ordering::Greater => *b,
            std::cmp::Ordering::Equal if rng.gen::<bool>() => *a,
            std::cmp::Ordering::Equal => *b,
        }),
        _ => unreachable!("choose_multiple returned more than requested"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn it_prefers_the_less_loaded_candidate() {
        for _ in 0..100 {
            assert_eq!(power_of_two_choices([3, 5], |i| i), Some(3));
        }
        assert_eq!(power_of_two_choices([7], |_| 0), Some(7));
        assert_eq!(power_of_two_choices(std::iter::empty(), |_| 0), None);
    }
}
