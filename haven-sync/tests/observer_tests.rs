use haven_sync::ObserverList;
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};

#[test]
fn observers_are_called_in_subscription_order() {
    let list = ObserverList::<u32>::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let a = seen.clone();
    list.add(move |v| a.lock().unwrap().push(("a", *v)));
    let b = seen.clone();
    let b_id = list.add(move |v| b.lock().unwrap().push(("b", *v)));
    assert_eq!(list.len(), 2);

    list.notify(&1);
    assert!(list.remove(b_id));
    assert!(!list.remove(b_id));
    list.notify(&2);

    assert_eq!(*seen.lock().unwrap(), vec![("a", 1), ("b", 1), ("a", 2)]);
}

#[test]
fn callbacks_may_unsubscribe_themselves() {
    let list = Arc::new(ObserverList::<()>::new());
    let calls = Arc::new(Mutex::new(0));
    let own_id = Arc::new(Mutex::new(None));

    let (l, c, id) = (list.clone(), calls.clone(), own_id.clone());
    let sub = list.add(move |_| {
        *c.lock().unwrap() += 1;
        if let Some(id) = *id.lock().unwrap() {
            l.remove(id);
        }
    });
    *own_id.lock().unwrap() = Some(sub);

    list.notify(&());
    list.notify(&());
    assert_eq!(*calls.lock().unwrap(), 1);
    assert!(list.is_empty());
}
