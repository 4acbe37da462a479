use super::*;
use crate::preference::Support;

fn memory() -> WorkingMemory {
    WorkingMemory::new(Arc::new(SymbolTable::new()), Arc::new(TimetagSource::new()))
}

fn top_state(wm: &mut WorkingMemory) -> IdHandle {
    let state = wm.make_identifier('S', Some(1));
    wm.add_ref(state);
    wm.mark_goal(state, 1, false).unwrap();
    state
}

fn pref(wm: &WorkingMemory, kind: PreferenceKind, id: IdHandle, attr: &str, value: Symbol) -> Preference {
    Preference {
        kind,
        id,
        attr: wm.symbols().intern_symbol(attr),
        value,
        referent: None,
        support: Support::O,
        instantiation: None,
        level: 1,
    }
}

#[test]
fn test_identifier_names_count_per_letter() {
    let mut wm = memory();
    let s1 = wm.make_identifier('s', Some(1));
    let o1 = wm.make_identifier('O', None);
    let s2 = wm.make_identifier('S', None);
    let odd = wm.make_identifier('7', None);
    assert_eq!(wm.name_of(s1), "S1");
    assert_eq!(wm.name_of(o1), "O1");
    assert_eq!(wm.name_of(s2), "S2");
    assert_eq!(wm.name_of(odd), "I1");
}

#[test]
fn test_changes_are_buffered_in_order() {
    let mut wm = memory();
    let state = top_state(&mut wm);
    let attr = wm.symbols().intern_symbol("name");
    let value = wm.symbols().intern_symbol("top");
    let timetag = wm.add_wme(state, attr, value, false, WmeOrigin::Architecture).unwrap();
    wm.remove_wme(timetag).unwrap();

    let changes = wm.take_changes();
    assert_eq!(changes.len(), 2);
    assert!(matches!(changes[0], WmeChange::Add(w) if w.timetag == timetag && w.id_is_goal));
    assert_eq!(changes[1], WmeChange::Remove(timetag));
    assert!(!wm.has_changes());
}

#[test]
fn test_wme_holds_references_on_its_symbols() {
    let mut wm = memory();
    let state = top_state(&mut wm);
    let child = wm.make_identifier('X', Some(1));
    let attr = wm.symbols().intern_symbol("thing");
    let timetag = wm.add_wme(state, attr, Symbol::Ident(child), false, WmeOrigin::Input).unwrap();
    assert_eq!(wm.identifier(child).unwrap().refcount(), 1);
    assert_eq!(wm.identifier(state).unwrap().refcount(), 2);

    wm.remove_wme(timetag).unwrap();
    assert_eq!(wm.identifier(child).unwrap().refcount(), 0);
    wm.reconcile().unwrap();
    assert!(!wm.is_live(child));
    assert!(wm.is_live(state));
}

#[test]
fn test_unused_identifier_is_freed_at_reconcile() {
    let mut wm = memory();
    let lonely = wm.make_identifier('L', None);
    let report = wm.reconcile().unwrap();
    assert_eq!(report.freed, 1);
    assert!(!wm.is_live(lonely));
}

#[test]
fn test_promotion_reaches_new_descendants() {
    let mut wm = memory();
    let state = top_state(&mut wm);
    let a = wm.make_identifier('A', None);
    let b = wm.make_identifier('B', None);
    let link = wm.symbols().intern_symbol("link");
    wm.add_wme(a, link, Symbol::Ident(b), false, WmeOrigin::Input).unwrap();
    wm.add_wme(state, link, Symbol::Ident(a), false, WmeOrigin::Input).unwrap();

    let report = wm.reconcile().unwrap();
    assert_eq!(report.promoted, 2);
    assert_eq!(wm.level_of(a), Some(1));
    assert_eq!(wm.level_of(b), Some(1));
}

#[test]
fn test_detached_cycle_is_reclaimed() {
    let mut wm = memory();
    let state = top_state(&mut wm);
    let next = wm.symbols().intern_symbol("next");
    let x = wm.make_identifier('X', Some(1));
    let y = wm.make_identifier('Y', Some(1));
    let root = wm.add_wme(state, next, Symbol::Ident(x), false, WmeOrigin::Input).unwrap();
    wm.add_wme(x, next, Symbol::Ident(y), false, WmeOrigin::Input).unwrap();
    wm.add_wme(y, next, Symbol::Ident(x), false, WmeOrigin::Input).unwrap();
    wm.reconcile().unwrap();

    wm.remove_wme(root).unwrap();
    let report = wm.reconcile().unwrap();
    assert_eq!(report.unreachable, 2);
    assert_eq!(report.freed, 2);
    assert!(!wm.is_live(x));
    assert!(!wm.is_live(y));
    assert_eq!(wm.wme_count(), 0);
    assert_eq!(wm.identifier_count(), 1);
}

#[test]
fn test_second_path_keeps_identifier_alive() {
    let mut wm = memory();
    let state = top_state(&mut wm);
    let a = wm.symbols().intern_symbol("a");
    let b = wm.symbols().intern_symbol("b");
    let x = wm.make_identifier('X', Some(1));
    let first = wm.add_wme(state, a, Symbol::Ident(x), false, WmeOrigin::Input).unwrap();
    wm.add_wme(state, b, Symbol::Ident(x), false, WmeOrigin::Input).unwrap();
    wm.reconcile().unwrap();

    wm.remove_wme(first).unwrap();
    let report = wm.reconcile().unwrap();
    assert_eq!(report.unreachable, 0);
    assert_eq!(wm.level_of(x), Some(1));
    assert!(wm.is_live(x));
}

#[test]
fn test_unreachable_identifier_loses_persistent_preferences() {
    let mut wm = memory();
    let state = top_state(&mut wm);
    let x = wm.make_identifier('X', Some(1));
    let link = wm.symbols().intern_symbol("link");
    let root = wm.add_wme(state, link, Symbol::Ident(x), false, WmeOrigin::Input).unwrap();
    let red = wm.symbols().intern_symbol("red");
    let color = pref(&wm, PreferenceKind::Acceptable, x, "color", red);
    wm.add_preference(color).unwrap();
    wm.update_changed_slots().unwrap();
    assert_eq!(wm.wme_count(), 2);

    wm.remove_wme(root).unwrap();
    let report = wm.reconcile().unwrap();
    assert_eq!(report.removed_preferences.len(), 1);
    wm.update_changed_slots().unwrap();
    wm.reconcile().unwrap();
    assert!(!wm.is_live(x));
    assert_eq!(wm.preferences().count(), 0);
}

#[test]
fn test_slot_facts_follow_preferences() {
    let mut wm = memory();
    let state = top_state(&mut wm);
    let color = wm.symbols().intern_symbol("color");
    let red = wm.symbols().intern_symbol("red");
    let blue = wm.symbols().intern_symbol("blue");

    wm.add_preference(pref(&wm, PreferenceKind::Acceptable, state, "color", red)).unwrap();
    wm.add_preference(pref(&wm, PreferenceKind::Acceptable, state, "color", blue)).unwrap();
    wm.update_changed_slots().unwrap();
    let mut values = wm.values_of(state, color);
    values.sort();
    let mut expected = vec![red, blue];
    expected.sort();
    assert_eq!(values, expected);

    let reject = wm.add_preference(pref(&wm, PreferenceKind::Reject, state, "color", red)).unwrap();
    wm.update_changed_slots().unwrap();
    assert_eq!(wm.values_of(state, color), vec![blue]);

    wm.remove_preference(reject).unwrap();
    wm.update_changed_slots().unwrap();
    assert_eq!(wm.values_of(state, color).len(), 2);
}

#[test]
fn test_operator_slot_mirrors_acceptable_preferences() {
    let mut wm = memory();
    let state = top_state(&mut wm);
    let op = wm.make_identifier('O', Some(1));
    let proposal = pref(&wm, PreferenceKind::Acceptable, state, "operator", Symbol::Ident(op));
    wm.add_preference(proposal).unwrap();
    assert_eq!(wm.changed_context_slots().count(), 1);
    wm.update_changed_slots().unwrap();

    let slot = wm.slot(state, wm.operator_attr()).unwrap();
    assert!(slot.is_context);
    let facts = wm.wmes_of(state);
    assert_eq!(facts.len(), 1);
    assert!(facts[0].acceptable);
    assert!(wm.values_of(state, wm.operator_attr()).is_empty());
}

#[test]
fn test_goal_depth_limit() {
    let mut wm = memory();
    wm.set_max_goal_depth(2);
    let deep = wm.make_identifier('S', None);
    let err = wm.mark_goal(deep, 3, true).unwrap_err();
    assert!(matches!(err, EngineError::ResourceExhaustion { resource: Resource::GoalDepth, limit: 2 }));
}

#[test]
fn test_release_below_zero_is_an_invariant_violation() {
    let mut wm = memory();
    let id = wm.make_identifier('X', None);
    if cfg!(debug_assertions) {
        assert!(wm.release(id).is_err());
    }
}
